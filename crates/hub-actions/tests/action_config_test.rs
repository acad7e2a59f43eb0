//! Parsing of stored action configurations
//!
//! Covers both the flat form written by this crate and the nested form
//! (`{"type": "led", "led": {...}}`) found in older `actions.json` tables.

use hub_actions::{Action, ActionKind, ActionRef, ActionTemplate, DeviceCommand, Rgb, TemplateRegistry};
use serde_json::json;

// ============================================================================
// Nested form
// ============================================================================

#[test]
fn test_nested_led_template() {
    let tpl = ActionTemplate::from_json(&json!({
        "id": "alert_red",
        "name": "Alert",
        "description": "Board LED red",
        "type": "led",
        "delay_ms": 100,
        "led": {"device": "board", "index": 3, "color": "#FF0000", "duration_ms": 500}
    }))
    .unwrap();

    assert_eq!(tpl.action.delay_ms, 100);
    match tpl.action.kind {
        ActionKind::Led(led) => {
            assert_eq!(led.index, 3);
            assert_eq!(led.rgb(), Some(Rgb::new(255, 0, 0)));
            assert_eq!(led.duration_ms, Some(500));
        }
        other => panic!("Expected Led action, got {other:?}"),
    }
}

#[test]
fn test_nested_device_and_cli() {
    let dev = Action::from_json(&json!({
        "type": "device",
        "device": {"device": "agx0", "action": "force_off"}
    }))
    .unwrap();
    assert!(matches!(
        dev.kind,
        ActionKind::DeviceCtrl(ref d) if d.action == DeviceCommand::ForceOff
    ));

    let cli = Action::from_json(&json!({
        "type": "cli",
        "cli": {"command": "free -m", "var_name": "mem", "timeout_ms": 2000}
    }))
    .unwrap();
    match cli.kind {
        ActionKind::Cli(c) => {
            assert_eq!(c.timeout_ms, 2000);
            assert_eq!(c.var_name.as_deref(), Some("mem"));
        }
        other => panic!("Expected Cli action, got {other:?}"),
    }
}

#[test]
fn test_nested_webhook_keeps_defaults() {
    let hook = Action::from_json(&json!({
        "type": "webhook",
        "webhook": {"url": "https://example.com/notify", "body_template": "{}"}
    }))
    .unwrap();
    match hook.kind {
        ActionKind::Webhook(w) => {
            assert_eq!(w.method, "POST");
            assert!(w.headers.is_empty());
        }
        other => panic!("Expected Webhook action, got {other:?}"),
    }
}

// ============================================================================
// Rule action lists
// ============================================================================

#[test]
fn test_mixed_rule_action_list() {
    let list = json!([
        {"template_id": "alert_red", "delay_ms": 200},
        {"type": "log", "message": "cpu hot: ${cpu_usage}", "level": 2},
        {"type": "set_var", "variable": "alarm.active", "value": true}
    ]);
    let refs: Vec<ActionRef> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|j| ActionRef::from_json(j).unwrap())
        .collect();

    assert_eq!(refs[0], ActionRef::template("alert_red", Some(200)));
    assert!(matches!(&refs[1], ActionRef::Inline(a) if a.type_name() == "log"));
    assert!(matches!(&refs[2], ActionRef::Inline(a) if a.type_name() == "set_var"));
}

#[test]
fn test_round_trip_through_table() {
    let registry = TemplateRegistry::new();
    registry
        .add(ActionTemplate::from_json(&json!({
            "id": "reboot_agx",
            "action": {"type": "device_ctrl", "device": "agx0", "action": "reset"}
        }))
        .unwrap())
        .unwrap();

    let stored: Vec<serde_json::Value> = registry
        .to_vec()
        .iter()
        .map(|t| serde_json::to_value(t).unwrap())
        .collect();
    assert_eq!(stored[0]["action"]["type"], "device_ctrl");

    let reloaded = TemplateRegistry::new();
    assert_eq!(reloaded.load(&stored), 1);
    assert_eq!(reloaded.get("reboot_agx"), registry.get("reboot_agx"));
}
