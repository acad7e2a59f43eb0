//! `automation.*` endpoint handlers
//!
//! Read-only endpoints are open; everything that changes state requires
//! authentication when the registry has a session validator.

mod actions;
mod control;
mod proxy;
mod rules;
mod sources;
mod variables;

use hub_automation::Automation;
use hub_core::HubResult;
use hub_rpc::RpcRegistry;
use serde_json::Value as Json;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

const OPEN: bool = false;
const AUTH: bool = true;

fn register<F, Fut>(registry: &RpcRegistry, automation: &Arc<Automation>, name: &str, requires_auth: bool, handler: F)
where
    F: Fn(Arc<Automation>, Json) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HubResult<Json>> + Send + 'static,
{
    let automation = automation.clone();
    registry.register(name, requires_auth, move |params| handler(automation.clone(), params));
}

/// Write the tables after an RPC mutation
///
/// A failed save leaves `config_modified` set so the status shows unsaved
/// changes.
async fn persist(automation: &Automation) {
    automation.mark_modified();
    if let Err(e) = automation.save_config().await {
        warn!(error = %e, "Configuration not saved");
    }
}

pub fn register_endpoints(registry: &RpcRegistry, automation: &Arc<Automation>) {
    register(registry, automation, "automation.status", OPEN, control::status);
    register(registry, automation, "automation.start", AUTH, control::start);
    register(registry, automation, "automation.stop", AUTH, control::stop);
    register(registry, automation, "automation.pause", AUTH, control::pause);
    register(registry, automation, "automation.resume", AUTH, control::resume);
    register(registry, automation, "automation.reload", AUTH, control::reload);
    register(registry, automation, "automation.save", AUTH, control::save);

    register(registry, automation, "automation.variables.list", OPEN, variables::list);
    register(registry, automation, "automation.variables.get", OPEN, variables::get);
    register(registry, automation, "automation.variables.set", AUTH, variables::set);

    register(registry, automation, "automation.rules.list", OPEN, rules::list);
    register(registry, automation, "automation.rules.get", OPEN, rules::get);
    register(registry, automation, "automation.rules.add", AUTH, rules::add);
    register(registry, automation, "automation.rules.enable", AUTH, rules::enable);
    register(registry, automation, "automation.rules.disable", AUTH, rules::disable);
    register(registry, automation, "automation.rules.delete", AUTH, rules::delete);
    register(registry, automation, "automation.rules.trigger", AUTH, rules::trigger);

    register(registry, automation, "automation.sources.list", OPEN, sources::list);
    register(registry, automation, "automation.sources.add", AUTH, sources::add);
    register(registry, automation, "automation.sources.delete", AUTH, sources::delete);
    register(registry, automation, "automation.sources.enable", AUTH, sources::enable);
    register(registry, automation, "automation.sources.disable", AUTH, sources::disable);
    register(registry, automation, "automation.sources.add_mapping", AUTH, sources::add_mapping);
    register(registry, automation, "automation.sources.remove_mapping", AUTH, sources::remove_mapping);

    register(registry, automation, "automation.actions.list", OPEN, actions::list);
    register(registry, automation, "automation.actions.get", OPEN, actions::get);
    register(registry, automation, "automation.actions.add", AUTH, actions::add);
    register(registry, automation, "automation.actions.delete", AUTH, actions::delete);
    register(registry, automation, "automation.actions.execute", AUTH, actions::execute);
    register(registry, automation, "automation.action.stats", OPEN, actions::stats);
    register(registry, automation, "automation.action.stats.reset", AUTH, actions::reset_stats);

    register(registry, automation, "automation.test.led", AUTH, actions::test_led);
    register(registry, automation, "automation.test.gpio", AUTH, actions::test_gpio);
    register(registry, automation, "automation.test.device", AUTH, actions::test_device);
    register(registry, automation, "automation.test.ssh", AUTH, actions::test_ssh);

    register(registry, automation, "automation.proxy.fetch", AUTH, proxy::fetch);
    register(registry, automation, "automation.proxy.websocket_test", AUTH, proxy::websocket_test);
    register(registry, automation, "automation.proxy.socketio_test", AUTH, proxy::socketio_test);

    info!(endpoints = registry.count(), "Automation endpoints registered");
}
