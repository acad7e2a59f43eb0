//! REST sources against a mock HTTP server

use hub_config::MemoryKvStore;
use hub_core::Value;
use hub_event_bus::EventBus;
use hub_sources::{Mapping, Source, SourceError, SourceManager, SourceState, SshAccess};
use hub_variables::VariableStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn setup() -> (SourceManager, Arc<VariableStore>) {
    let vars = VariableStore::new(Arc::new(EventBus::new()), Arc::new(MemoryKvStore::new()));
    (SourceManager::new(vars.clone(), SshAccess::none()), vars)
}

async fn wait_for(vars: &VariableStore, name: &str, expected: Value) -> bool {
    for _ in 0..100 {
        if vars.get(name).ok() == Some(expected.clone()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_poll_now_writes_mapped_variables() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/m"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "cpu": {"usage": 95},
            "gpu": [{"temp": 61.5}],
            "host": "node-1"
        })))
        .mount(&server)
        .await;

    let (mgr, vars) = setup();
    let source = Source::rest("srv", format!("{}/m", server.uri()))
        .with_mapping(Mapping::new("cpu.usage", "cpu_usage"))
        .with_mapping(Mapping::new("gpu[0].temp", "gpu_temp"))
        .with_mapping(Mapping::new("host", "srv.host"));
    mgr.add(source).unwrap();

    let snap = mgr.poll_now("srv").await.unwrap();
    assert!(snap.runtime.connected);
    assert_eq!(snap.runtime.state, SourceState::Connected);
    assert_eq!(snap.runtime.messages, 1);
    assert_eq!(snap.runtime.last_value.as_ref().unwrap()["cpu"]["usage"], 95);

    assert_eq!(vars.get("cpu_usage").unwrap(), Value::Int(95));
    assert_eq!(vars.get("gpu_temp").unwrap(), Value::Float(61.5));
    assert_eq!(vars.get("srv.host").unwrap(), Value::from("node-1"));
    // Mapped variables belong to their source
    assert_eq!(
        vars.get_variable("cpu_usage").unwrap().source_id.as_deref(),
        Some("srv")
    );
}

#[tokio::test]
async fn test_bare_json_path_upgrade() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"devices": [{"temp": 40}]})))
        .mount(&server)
        .await;

    let (mgr, vars) = setup();
    let source = Source::from_json(&json!({
        "id": "gpu",
        "type": "rest",
        "url": server.uri(),
        "json_path": "devices[0].temp"
    }))
    .unwrap();
    mgr.add(source).unwrap();
    mgr.poll_now("gpu").await.unwrap();

    let var = vars.get_variable("gpu.devices_0_.temp").unwrap();
    assert_eq!(var.value, Value::Int(40));
    assert_eq!(var.source_id.as_deref(), Some("gpu"));
}

#[tokio::test]
async fn test_error_status_marks_disconnected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let (mgr, _) = setup();
    mgr.add(Source::rest("srv", server.uri())).unwrap();

    let err = mgr.poll_now("srv").await.unwrap_err();
    assert!(matches!(err, SourceError::Status(503)));
    let snap = mgr.get_copy("srv").unwrap();
    assert!(!snap.runtime.connected);
    assert_eq!(snap.runtime.state, SourceState::Error);
    assert_eq!(snap.runtime.errors, 1);
    assert!(snap.runtime.last_error.is_some());
}

#[tokio::test]
async fn test_non_json_body_is_counted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>hi</html>"))
        .mount(&server)
        .await;

    let (mgr, _) = setup();
    mgr.add(Source::rest("srv", server.uri())).unwrap();

    assert!(matches!(mgr.poll_now("srv").await, Err(SourceError::NotJson(_))));
    assert_eq!(mgr.get_copy("srv").unwrap().runtime.dropped_non_json, 1);
}

#[tokio::test]
async fn test_auth_header_and_auto_discover() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": {"b": [1, 2]}})))
        .mount(&server)
        .await;

    let (mgr, vars) = setup();
    let source = Source::from_json(&json!({
        "id": "secure",
        "type": "rest",
        "url": server.uri(),
        "auth_header": "Bearer abc"
    }))
    .unwrap();
    mgr.add(source).unwrap();
    mgr.poll_now("secure").await.unwrap();

    let snap = mgr.get_copy("secure").unwrap();
    let discovered = snap.runtime.discovered.unwrap();
    assert!(discovered.iter().any(|p| p.path == "a.b" && p.kind == "array"));
    // Discovery never creates variables
    assert_eq!(vars.count(), 0);
}

#[tokio::test]
async fn test_worker_polls_on_schedule() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cpu": {"usage": 42}})))
        .mount(&server)
        .await;

    let (mgr, vars) = setup();
    let source = Source::rest("srv", server.uri())
        .with_poll_interval(50)
        .with_mapping(Mapping::new("cpu.usage", "cpu_usage"));
    mgr.add(source).unwrap();
    assert_eq!(mgr.start_all(), 1);

    assert!(wait_for(&vars, "cpu_usage", Value::Int(42)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(mgr.get_copy("srv").unwrap().runtime.messages >= 2);

    mgr.stop_all().await;
    let snap = mgr.get_copy("srv").unwrap();
    assert_eq!(snap.runtime.state, SourceState::Idle);
    assert_eq!(mgr.stats().workers, 0);
}

#[tokio::test]
async fn test_disable_stops_worker_and_remove_drops_variables() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
        .mount(&server)
        .await;

    let (mgr, vars) = setup();
    mgr.start_all();
    mgr.add(
        Source::rest("srv", server.uri())
            .with_poll_interval(50)
            .with_mapping(Mapping::new("v", "srv.v")),
    )
    .unwrap();
    assert!(wait_for(&vars, "srv.v", Value::Int(1)).await);

    mgr.disable("srv").await.unwrap();
    assert_eq!(mgr.stats().workers, 0);
    assert!(!mgr.get_copy("srv").unwrap().config.enabled);

    mgr.enable("srv").unwrap();
    assert_eq!(mgr.stats().workers, 1);

    let dropped = mgr.remove("srv").await.unwrap();
    assert_eq!(dropped, 1);
    assert!(!vars.exists("srv.v"));
    mgr.stop_all().await;
}

#[tokio::test]
async fn test_transform_applied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"mem": {"used": 2048}})))
        .mount(&server)
        .await;

    let (mgr, vars) = setup();
    mgr.add(
        Source::rest("srv", server.uri())
            .with_mapping(Mapping::new("mem.used", "mem_kb").with_transform("/1024")),
    )
    .unwrap();
    mgr.poll_now("srv").await.unwrap();

    assert_eq!(vars.get("mem_kb").unwrap().as_f64(), Some(2.0));
}
