//! SSH-backed and mirroring `variable` sources

use hub_actions::capability::mock::MockSsh;
use hub_actions::{CommandOutput, SshCommand, SshCommandRegistry, SshHost, SshHostRegistry};
use hub_config::MemoryKvStore;
use hub_core::{Context, HubError, Value};
use hub_event_bus::EventBus;
use hub_sources::{Source, SourceError, SourceManager, SourceState, SshAccess};
use hub_variables::VariableStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    mgr: SourceManager,
    vars: Arc<VariableStore>,
    ssh: Arc<MockSsh>,
    commands: Arc<SshCommandRegistry>,
}

fn fixture() -> Fixture {
    let vars = VariableStore::new(Arc::new(EventBus::new()), Arc::new(MemoryKvStore::new()));
    let ssh = MockSsh::new();
    let hosts = Arc::new(SshHostRegistry::new());
    hosts
        .add(
            serde_json::from_value::<SshHost>(json!({
                "id": "nas", "host": "10.0.0.5", "username": "admin"
            }))
            .unwrap(),
        )
        .unwrap();
    let commands = Arc::new(SshCommandRegistry::new());
    let access = SshAccess {
        executor: Some(ssh.clone()),
        hosts,
        commands: commands.clone(),
    };
    Fixture {
        mgr: SourceManager::new(vars.clone(), access),
        vars,
        ssh,
        commands,
    }
}

fn command_source(extra: serde_json::Value) -> Source {
    let mut cfg = json!({
        "id": "job",
        "type": "variable",
        "ssh_host_id": "nas",
        "ssh_command": "cat /run/job.state"
    });
    if let (Some(base), Some(extra)) = (cfg.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    Source::from_json(&cfg).unwrap()
}

#[tokio::test]
async fn test_bundle_after_successful_run() {
    let f = fixture();
    f.ssh.respond("job.state", CommandOutput::success("code=42\n"));
    f.mgr
        .add(command_source(json!({"ssh_extract_pattern": "(\\d+)"})))
        .unwrap();

    f.mgr.poll_now("job").await.unwrap();

    assert_eq!(f.vars.get("job.status").unwrap(), Value::from("success"));
    assert_eq!(f.vars.get("job.exit_code").unwrap(), Value::Int(0));
    assert_eq!(f.vars.get("job.extracted").unwrap(), Value::from("42"));
    assert_eq!(f.vars.get("job.expect_matched").unwrap(), Value::Bool(false));
    assert_eq!(f.vars.get("job.fail_matched").unwrap(), Value::Bool(false));
    assert_eq!(f.vars.get("job.host").unwrap(), Value::from("10.0.0.5"));
    assert!(f.vars.get("job.timestamp").unwrap().as_i64().unwrap() > 0);

    let calls = f.ssh.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0.username, "admin");
    assert_eq!(calls[0].1, "cat /run/job.state");
}

#[tokio::test]
async fn test_repeated_runs_do_not_duplicate_bundle() {
    let f = fixture();
    f.ssh.respond("job.state", CommandOutput::failure(3, "boom"));
    f.mgr.add(command_source(json!({}))).unwrap();

    f.mgr.poll_now("job").await.unwrap();
    f.mgr.poll_now("job").await.unwrap();

    assert_eq!(f.vars.list(Some("job.")).len(), 7);
    assert_eq!(f.vars.get("job.status").unwrap(), Value::from("failed"));
    assert_eq!(f.vars.get("job.exit_code").unwrap(), Value::Int(3));
    assert_eq!(f.mgr.get_copy("job").unwrap().runtime.messages, 2);
}

#[tokio::test]
async fn test_custom_prefix_and_patterns() {
    let f = fixture();
    f.ssh
        .respond("job.state", CommandOutput::success("state: READY\nerrors: none\n"));
    f.mgr
        .add(command_source(json!({
            "var_prefix": "backup",
            "ssh_expect_pattern": "READY",
            "ssh_fail_pattern": "errors: [1-9]"
        })))
        .unwrap();

    f.mgr.poll_now("job").await.unwrap();

    assert_eq!(f.vars.get("backup.status").unwrap(), Value::from("success"));
    assert_eq!(f.vars.get("backup.expect_matched").unwrap(), Value::Bool(true));
    assert_eq!(f.vars.get("backup.fail_matched").unwrap(), Value::Bool(false));
    assert!(!f.vars.exists("job.status"));
}

#[tokio::test]
async fn test_transport_error_writes_failed_bundle() {
    let f = fixture();
    f.ssh
        .fail("job.state", HubError::Connection("connection refused".into()));
    f.mgr.add(command_source(json!({}))).unwrap();

    assert!(f.mgr.poll_now("job").await.is_err());
    assert_eq!(f.vars.get("job.status").unwrap(), Value::from("failed"));
    assert_eq!(f.vars.get("job.exit_code").unwrap(), Value::Int(-1));
    let snap = f.mgr.get_copy("job").unwrap();
    assert_eq!(snap.runtime.state, SourceState::Error);
}

#[tokio::test]
async fn test_stored_command_reference() {
    let f = fixture();
    f.commands
        .add(
            serde_json::from_value::<SshCommand>(json!({
                "id": "uptime", "host_id": "nas", "command": "uptime -p"
            }))
            .unwrap(),
        )
        .unwrap();
    f.ssh.respond("uptime", CommandOutput::success("up 3 days"));

    let source = Source::from_json(&json!({
        "id": "up", "type": "variable", "ssh_cmd_id": "uptime"
    }))
    .unwrap();
    f.mgr.add(source).unwrap();
    f.mgr.poll_now("up").await.unwrap();

    assert_eq!(f.vars.get("up.status").unwrap(), Value::from("success"));
    assert_eq!(f.ssh.commands(), vec!["uptime -p".to_string()]);
    assert!(f.commands.get("uptime").unwrap().last_exec_time.is_some());
}

#[tokio::test]
async fn test_missing_stored_command() {
    let f = fixture();
    let source = Source::from_json(&json!({
        "id": "ghost", "type": "variable", "ssh_cmd_id": "nope"
    }))
    .unwrap();
    f.mgr.add(source).unwrap();
    assert!(f.mgr.poll_now("ghost").await.is_err());
    assert!(f.ssh.calls().is_empty());
}

#[tokio::test]
async fn test_command_expands_variables() {
    let f = fixture();
    f.vars
        .upsert("cfg.unit", Value::from("nginx"), Context::new())
        .unwrap();
    f.mgr
        .add(command_source(json!({"ssh_command": "systemctl is-active ${cfg.unit}"})))
        .unwrap();

    f.mgr.poll_now("job").await.unwrap();
    assert_eq!(f.ssh.commands(), vec!["systemctl is-active nginx".to_string()]);
}

#[tokio::test]
async fn test_mirror_single_variable() {
    let f = fixture();
    f.vars
        .upsert("sensors.temp", Value::Float(21.5), Context::new())
        .unwrap();
    let source = Source::from_json(&json!({
        "id": "mirror",
        "type": "variable",
        "var_name": "sensors.temp",
        "mappings": [{"json_path": "value", "var_name": "mirror.temp"}]
    }))
    .unwrap();
    f.mgr.add(source).unwrap();

    f.mgr.poll_now("mirror").await.unwrap();
    assert_eq!(f.vars.get("mirror.temp").unwrap(), Value::Float(21.5));

    f.vars.set("sensors.temp", Value::Float(22.0), Context::new()).unwrap();
    f.mgr.poll_now("mirror").await.unwrap();
    assert_eq!(f.vars.get("mirror.temp").unwrap(), Value::Float(22.0));
}

#[tokio::test]
async fn test_mirror_missing_variable_is_an_error() {
    let f = fixture();
    let source = Source::from_json(&json!({
        "id": "mirror", "type": "variable", "var_name": "nowhere.value"
    }))
    .unwrap();
    f.mgr.add(source).unwrap();
    assert!(matches!(
        f.mgr.poll_now("mirror").await,
        Err(SourceError::Variable(_))
    ));
}

#[tokio::test]
async fn test_worker_runs_command_on_schedule() {
    let f = fixture();
    f.ssh.respond("job.state", CommandOutput::success("ok"));
    f.mgr
        .add(command_source(json!({"poll_interval_ms": 50})))
        .unwrap();
    f.mgr.start_all();

    for _ in 0..100 {
        if f.ssh.calls().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    f.mgr.stop_all().await;
    assert!(f.ssh.calls().len() >= 2);
    assert_eq!(f.vars.get("job.status").unwrap(), Value::from("success"));
}
