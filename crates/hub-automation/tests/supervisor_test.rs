//! End-to-end runs of the supervisor against a mock REST endpoint

use hub_actions::capability::mock::MockCapabilities;
use hub_actions::Rgb;
use hub_automation::{Automation, EngineState};
use hub_config::MemoryKvStore;
use hub_core::{Context, HubError, Value};
use hub_event_bus::EventBus;
use hub_variables::{Variable, VariableStore};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_table(dir: &Path, key: &str, data: serde_json::Value) {
    std::fs::write(dir.join(format!("{}.json", key)), data.to_string()).unwrap();
}

fn setup(dir: &TempDir) -> (Arc<Automation>, MockCapabilities) {
    let vars = VariableStore::new(Arc::new(EventBus::new()), Arc::new(MemoryKvStore::new()));
    let mocks = MockCapabilities::new();
    (Automation::new(vars, mocks.capabilities(), dir.path()), mocks)
}

fn hot_rule(cooldown_ms: u64) -> serde_json::Value {
    json!({
        "id": "cpu_hot",
        "name": "CPU hot",
        "cooldown_ms": cooldown_ms,
        "conditions": [{"variable": "cpu_usage", "operator": "gt", "value": 80}],
        "actions": [{"type": "led", "device": "board", "color": "#FF0000"}]
    })
}

async fn mock_metrics(body: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;
    server
}

async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_rest_threshold_lights_led() {
    let server = mock_metrics(json!({"cpu": {"usage": 95}})).await;
    let dir = TempDir::new().unwrap();
    write_table(
        dir.path(),
        "sources",
        json!([{
            "id": "srv",
            "type": "rest",
            "url": format!("{}/metrics", server.uri()),
            "poll_interval_ms": 1000,
            "mappings": [{"json_path": "cpu.usage", "var_name": "cpu_usage"}]
        }]),
    );
    write_table(dir.path(), "rules", json!([hot_rule(0)]));

    let (auto, mocks) = setup(&dir);
    auto.init().await.unwrap();
    auto.start().await.unwrap();

    assert!(wait_until(|| mocks.led.calls().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // The value stays at 95 across polls: no new edge, no new firing
    let calls = mocks.led.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].color, Some(Rgb::new(255, 0, 0)));
    let status = auto.status();
    assert_eq!(status.state, EngineState::Running);
    assert_eq!(status.rule_triggers, 1);
    assert_eq!(status.sources_count, 1);
    assert_eq!(status.rules_active, 1);
    assert_eq!(auto.variables().get("cpu_usage").unwrap(), Value::Int(95));

    auto.shutdown().await;
}

#[tokio::test]
async fn test_cooldown_limits_burst() {
    let dir = TempDir::new().unwrap();
    write_table(dir.path(), "rules", json!([hot_rule(60_000)]));

    let (auto, mocks) = setup(&dir);
    auto.init().await.unwrap();
    auto.variables()
        .register(Variable::new("cpu_usage", 10i64))
        .unwrap();
    auto.start().await.unwrap();

    for v in [95i64, 96, 97] {
        auto.variables().set("cpu_usage", v, Context::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(mocks.led.calls().len(), 1);
    let rules = auto.rules().stats();
    assert_eq!(rules.total_triggers, 1);
    assert_eq!(rules.cooldown_drops, 2);
    assert_eq!(auto.rules().rules().get("cpu_hot").unwrap().trigger_count, 1);
    auto.shutdown().await;
}

#[tokio::test]
async fn test_pause_keeps_ingesting() {
    let dir = TempDir::new().unwrap();
    write_table(dir.path(), "rules", json!([hot_rule(0)]));

    let (auto, mocks) = setup(&dir);
    auto.init().await.unwrap();
    auto.variables()
        .register(Variable::new("cpu_usage", 10i64))
        .unwrap();
    auto.start().await.unwrap();
    auto.pause().await.unwrap();

    auto.variables().set("cpu_usage", 95i64, Context::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(mocks.led.calls().is_empty());
    // One from the start-up sweep, one for the change
    assert_eq!(auto.rules().stats().total_evaluations, 2);

    auto.resume().await.unwrap();
    assert_eq!(auto.state(), EngineState::Running);
    auto.shutdown().await;
}

#[tokio::test]
async fn test_reload_retains_rule_variables() {
    let server = mock_metrics(json!({"cpu": {"usage": 42}, "mem": 17})).await;
    let dir = TempDir::new().unwrap();
    write_table(
        dir.path(),
        "sources",
        json!([{
            "id": "srv",
            "type": "rest",
            "url": format!("{}/metrics", server.uri()),
            "poll_interval_ms": 60000,
            "mappings": [
                {"json_path": "cpu.usage", "var_name": "cpu_usage"},
                {"json_path": "mem", "var_name": "mem_usage"}
            ]
        }]),
    );
    write_table(dir.path(), "rules", json!([hot_rule(0)]));

    let (auto, _mocks) = setup(&dir);
    auto.init().await.unwrap();
    auto.start().await.unwrap();
    let vars = auto.variables().clone();
    assert!(wait_until(|| vars.exists("cpu_usage") && vars.exists("mem_usage")).await);

    write_table(dir.path(), "sources", json!([]));
    auto.mark_modified();
    let summary = auto.reload().await.unwrap();

    assert_eq!(summary.sources_removed, 1);
    assert_eq!(summary.rules_added, 0);
    assert_eq!(summary.rules_removed, 0);
    assert_eq!(summary.variables_retained, 1);
    assert!(vars.exists("cpu_usage"));
    assert!(!vars.exists("mem_usage"));
    assert_eq!(auto.sources().count(), 0);
    assert!(!auto.config_modified());
    auto.shutdown().await;
}

#[tokio::test]
async fn test_reload_diffs_rules_and_templates() {
    let dir = TempDir::new().unwrap();
    write_table(dir.path(), "rules", json!([hot_rule(0)]));
    write_table(
        dir.path(),
        "actions",
        json!([{"id": "blink", "action": {"type": "gpio", "pin": 4, "level": true}}]),
    );

    let (auto, _mocks) = setup(&dir);
    auto.init().await.unwrap();
    assert_eq!(auto.templates().count(), 1);

    let mut changed = hot_rule(5000);
    changed["conditions"][0]["value"] = json!(90);
    write_table(
        dir.path(),
        "rules",
        json!([changed, {
            "id": "door",
            "conditions": [{"variable": "door", "operator": "changed"}],
            "actions": []
        }]),
    );
    write_table(
        dir.path(),
        "actions",
        json!([{"id": "beep", "action": {"type": "gpio", "pin": 5, "level": true}}]),
    );

    let summary = auto.reload().await.unwrap();
    assert_eq!(summary.rules_replaced, 1);
    assert_eq!(summary.rules_added, 1);
    assert_eq!(summary.templates_added, 1);
    assert_eq!(summary.templates_removed, 1);
    assert_eq!(auto.rules().rules().get("cpu_hot").unwrap().cooldown_ms, 5000);
    assert!(auto.templates().get("blink").is_none());

    // Unchanged tables reload as a no-op
    let again = auto.reload().await.unwrap();
    assert_eq!(again, Default::default());
}

#[tokio::test]
async fn test_reload_parse_error_keeps_state() {
    let dir = TempDir::new().unwrap();
    write_table(dir.path(), "rules", json!([hot_rule(0)]));
    let (auto, _mocks) = setup(&dir);
    auto.init().await.unwrap();
    auto.start().await.unwrap();

    std::fs::write(dir.path().join("rules.json"), "[{broken").unwrap();
    assert!(auto.reload().await.is_err());

    let status = auto.status();
    assert_eq!(status.state, EngineState::Running);
    assert_eq!(status.rules_count, 1);
    assert!(status.last_error.is_some());
    auto.shutdown().await;
}

#[tokio::test]
async fn test_save_config_round_trip() {
    let dir = TempDir::new().unwrap();
    let (auto, _mocks) = setup(&dir);
    auto.init().await.unwrap();

    let rule = hub_rules::Rule::from_json(&hot_rule(1000)).unwrap();
    auto.rules().add_rule(rule).unwrap();
    auto.sources()
        .add(hub_sources::Source::rest("srv", "http://127.0.0.1:1/metrics"))
        .unwrap();
    auto.mark_modified();
    auto.save_config().await.unwrap();
    assert!(!auto.config_modified());

    let (fresh, _mocks) = setup(&dir);
    fresh.init().await.unwrap();
    assert_eq!(fresh.rules().rules().count(), 1);
    assert_eq!(fresh.rules().rules().get("cpu_hot").unwrap().cooldown_ms, 1000);
    assert!(fresh.sources().exists("srv"));
}

#[tokio::test]
async fn test_rejected_transitions() {
    let dir = TempDir::new().unwrap();
    let (auto, _mocks) = setup(&dir);

    assert!(matches!(auto.pause().await, Err(HubError::InvalidState(_))));
    auto.init().await.unwrap();
    assert!(matches!(auto.resume().await, Err(HubError::InvalidState(_))));
    auto.start().await.unwrap();
    auto.pause().await.unwrap();
    assert!(matches!(auto.start().await, Err(HubError::InvalidState(_))));
    auto.stop().await.unwrap();
    assert_eq!(auto.status().uptime_ms, 0);
}
