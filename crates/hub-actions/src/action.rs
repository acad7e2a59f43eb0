//! Action model
//!
//! Actions are the units of work a rule firing dispatches. The JSON form is
//! flat, `{"type": "led", "delay_ms": 0, "device": "board", ...}`; the older
//! nested form `{"type": "led", "led": {...}}` is accepted on input and
//! normalized.

use crate::error::{ActionError, ActionResult};
use hub_core::{Value, VariableName};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Accept `true`/`false` as well as `0`/`1`
fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrInt {
        Bool(bool),
        Int(i64),
    }

    match BoolOrInt::deserialize(deserializer)? {
        BoolOrInt::Bool(b) => Ok(b),
        BoolOrInt::Int(i) => Ok(i != 0),
    }
}

/// Longest accepted `delay_ms`: one day
pub const MAX_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

fn check_delay(delay_ms: u64) -> ActionResult<()> {
    if delay_ms > MAX_DELAY_MS {
        return Err(ActionError::InvalidAction(format!(
            "delay_ms {delay_ms} exceeds {MAX_DELAY_MS}"
        )));
    }
    Ok(())
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn default_led_index() -> u8 {
    255
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_cli_timeout() -> u64 {
    5_000
}

fn default_webhook_timeout() -> u64 {
    10_000
}

fn default_log_level() -> u8 {
    3
}

fn default_ready_timeout_sec() -> u64 {
    60
}

fn default_check_interval_ms() -> u64 {
    3_000
}

/// A single dispatchable action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub struct Action {
    /// Wait measured from enqueue time
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,

    #[serde(flatten)]
    pub kind: ActionKind,
}

#[derive(Deserialize)]
struct ActionRepr {
    #[serde(default)]
    delay_ms: u64,
    #[serde(flatten)]
    kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Led(LedAction),
    Gpio(GpioAction),
    #[serde(rename = "device_ctrl", alias = "device")]
    DeviceCtrl(DeviceCtrlAction),
    #[serde(rename = "ssh_cmd", alias = "ssh")]
    SshCmd(SshCmdAction),
    #[serde(rename = "ssh_cmd_ref", alias = "ssh_ref")]
    SshCmdRef(SshCmdRefAction),
    Cli(CliAction),
    Webhook(WebhookAction),
    Log(LogAction),
    SetVar(SetVarAction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedAction {
    pub device: String,

    /// 255 fills every LED of the device
    #[serde(default = "default_led_index")]
    pub index: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl LedAction {
    /// Canonical device name; short aliases map onto the LED drivers
    pub fn device_name(&self) -> &str {
        match self.device.as_str() {
            "touch" => "led_touch",
            "board" => "led_board",
            "matrix" => "led_matrix",
            other => other,
        }
    }

    /// Color to apply; a `color` string wins over `r`/`g`/`b`
    pub fn rgb(&self) -> Option<Rgb> {
        match &self.color {
            Some(c) => Rgb::parse(c),
            None => Some(Rgb {
                r: self.r.unwrap_or(0),
                g: self.g.unwrap_or(0),
                b: self.b.unwrap_or(0),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#RRGGBB`, `rgb(r,g,b)` or a color name
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix('#') {
            if hex.len() != 6 || !hex.is_ascii() {
                return None;
            }
            let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
            return Some(Self::new(byte(0)?, byte(2)?, byte(4)?));
        }
        if let Some(inner) = s
            .strip_prefix("rgb(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let mut parts = inner.split(',').map(|p| p.trim().parse::<u8>().ok());
            let (r, g, b) = (parts.next()??, parts.next()??, parts.next()??);
            if parts.next().is_some() {
                return None;
            }
            return Some(Self::new(r, g, b));
        }
        let named = match s.to_ascii_lowercase().as_str() {
            "red" => Self::new(255, 0, 0),
            "green" => Self::new(0, 255, 0),
            "blue" => Self::new(0, 0, 255),
            "white" => Self::new(255, 255, 255),
            "black" | "off" => Self::new(0, 0, 0),
            "yellow" => Self::new(255, 255, 0),
            "cyan" => Self::new(0, 255, 255),
            "magenta" => Self::new(255, 0, 255),
            "orange" => Self::new(255, 165, 0),
            "purple" => Self::new(128, 0, 128),
            "pink" => Self::new(255, 192, 203),
            _ => return None,
        };
        Some(named)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpioAction {
    pub pin: u32,
    #[serde(deserialize_with = "bool_or_int")]
    pub level: bool,
    /// 0 holds the level; otherwise pulse and restore the opposite level
    #[serde(default)]
    pub pulse_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    #[serde(alias = "on")]
    PowerOn,
    #[serde(alias = "off")]
    PowerOff,
    ForceOff,
    #[serde(alias = "reboot")]
    Reset,
    Recovery,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::PowerOn => "power_on",
            DeviceCommand::PowerOff => "power_off",
            DeviceCommand::ForceOff => "force_off",
            DeviceCommand::Reset => "reset",
            DeviceCommand::Recovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCtrlAction {
    pub device: String,
    pub action: DeviceCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshCmdAction {
    pub host_ref: String,
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Receives `{prefix}.exit_code`, `.status` and `.output`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_prefix: Option<String>,

    #[serde(default)]
    pub nohup: bool,

    #[serde(default)]
    pub service_mode: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_pattern: Option<String>,

    #[serde(default = "default_ready_timeout_sec")]
    pub ready_timeout_sec: u64,

    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,

    /// Stream exec events to this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshCmdRefAction {
    pub cmd_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliAction {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_name: Option<String>,

    #[serde(default = "default_cli_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookAction {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default, alias = "body", skip_serializing_if = "Option::is_none")]
    pub body_template: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogAction {
    pub message: String,

    /// 1=error, 2=warn, 3=info, 4=debug, 5=trace
    #[serde(default = "default_log_level")]
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetVarAction {
    pub variable: String,
    pub value: Value,
}

/// Key under which the nested input form keeps the parameters of a type
fn nested_key(type_name: &str) -> Option<&'static str> {
    Some(match type_name {
        "led" => "led",
        "gpio" => "gpio",
        "device" | "device_ctrl" => "device",
        "log" => "log",
        "set_var" => "set_var",
        "webhook" => "webhook",
        "ssh_ref" | "ssh_cmd_ref" => "ssh_ref",
        "cli" => "cli",
        "ssh" | "ssh_cmd" => "ssh",
        _ => return None,
    })
}

/// Lift `{"type": t, t: {...}}` into the flat form
fn normalize(mut json: serde_json::Value) -> serde_json::Value {
    let Some(obj) = json.as_object_mut() else {
        return json;
    };
    let Some(key) = obj
        .get("type")
        .and_then(|t| t.as_str())
        .and_then(nested_key)
    else {
        return json;
    };
    // `device` is both a nested key and a device_ctrl field; only an object lifts
    if let Some(serde_json::Value::Object(nested)) = obj.get(key).cloned() {
        obj.remove(key);
        for (k, v) in nested {
            obj.entry(k).or_insert(v);
        }
    }
    json
}

impl TryFrom<serde_json::Value> for Action {
    type Error = ActionError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        let repr: ActionRepr = serde_json::from_value(normalize(json))
            .map_err(|e| ActionError::InvalidAction(e.to_string()))?;
        Ok(Action {
            delay_ms: repr.delay_ms,
            kind: repr.kind,
        })
    }
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self { delay_ms: 0, kind }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Parse and validate an action from JSON
    pub fn from_json(json: &serde_json::Value) -> ActionResult<Self> {
        let action = Action::try_from(json.clone())?;
        action.validate()?;
        Ok(action)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Check field contents that serde cannot express
    pub fn validate(&self) -> ActionResult<()> {
        let invalid = |msg: &str| Err(ActionError::InvalidAction(msg.to_string()));
        check_delay(self.delay_ms)?;
        match &self.kind {
            ActionKind::Led(led) => {
                if led.device.is_empty() {
                    return invalid("led: device is required");
                }
                if let Some(color) = &led.color {
                    if Rgb::parse(color).is_none() {
                        return invalid(&format!("led: unknown color '{color}'"));
                    }
                }
            }
            ActionKind::Gpio(_) => {}
            ActionKind::DeviceCtrl(dev) => {
                if dev.device.is_empty() {
                    return invalid("device_ctrl: device is required");
                }
            }
            ActionKind::SshCmd(ssh) => {
                if ssh.host_ref.is_empty() || ssh.command.is_empty() {
                    return invalid("ssh_cmd: host_ref and command are required");
                }
                for pattern in [&ssh.ready_pattern, &ssh.fail_pattern].into_iter().flatten() {
                    compile_pattern(pattern)?;
                }
                if ssh.service_mode && ssh.ready_pattern.is_none() {
                    return invalid("ssh_cmd: service_mode requires ready_pattern");
                }
            }
            ActionKind::SshCmdRef(r) => {
                if r.cmd_id.is_empty() {
                    return invalid("ssh_cmd_ref: cmd_id is required");
                }
            }
            ActionKind::Cli(cli) => {
                if cli.command.trim().is_empty() {
                    return invalid("cli: command is required");
                }
            }
            ActionKind::Webhook(hook) => {
                if !hook.url.starts_with("http://") && !hook.url.starts_with("https://") {
                    return invalid("webhook: url must be http(s)");
                }
                if !matches!(
                    hook.method.to_ascii_uppercase().as_str(),
                    "GET" | "POST" | "PUT"
                ) {
                    return invalid(&format!("webhook: unsupported method {}", hook.method));
                }
            }
            ActionKind::Log(log) => {
                if !(1..=5).contains(&log.level) {
                    return invalid("log: level must be 1..5");
                }
            }
            ActionKind::SetVar(set) => {
                VariableName::validate(&set.variable)
                    .map_err(|e| ActionError::InvalidAction(format!("set_var: {e}")))?;
            }
        }
        Ok(())
    }
}

impl ActionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionKind::Led(_) => "led",
            ActionKind::Gpio(_) => "gpio",
            ActionKind::DeviceCtrl(_) => "device_ctrl",
            ActionKind::SshCmd(_) => "ssh_cmd",
            ActionKind::SshCmdRef(_) => "ssh_cmd_ref",
            ActionKind::Cli(_) => "cli",
            ActionKind::Webhook(_) => "webhook",
            ActionKind::Log(_) => "log",
            ActionKind::SetVar(_) => "set_var",
        }
    }
}

pub(crate) fn compile_pattern(pattern: &str) -> ActionResult<Regex> {
    Regex::new(pattern).map_err(|source| ActionError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// An entry of a rule's action list: a template reference or an inline action
///
/// Template references are resolved when the dispatcher dequeues them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionRef {
    Template {
        template_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
    },
    Inline(Action),
}

impl ActionRef {
    pub fn template(template_id: impl Into<String>, delay_ms: Option<u64>) -> Self {
        ActionRef::Template {
            template_id: template_id.into(),
            delay_ms,
        }
    }

    pub fn from_json(json: &serde_json::Value) -> ActionResult<Self> {
        if let Some(id) = json.get("template_id").and_then(|v| v.as_str()) {
            if id.is_empty() {
                return Err(ActionError::InvalidAction("empty template_id".into()));
            }
            let delay_ms = match json.get("delay_ms") {
                None | Some(serde_json::Value::Null) => None,
                Some(v) => Some(v.as_u64().ok_or_else(|| {
                    ActionError::InvalidAction("delay_ms must be a non-negative integer".into())
                })?),
            };
            if let Some(delay) = delay_ms {
                check_delay(delay)?;
            }
            return Ok(ActionRef::template(id, delay_ms));
        }
        Action::from_json(json).map(ActionRef::Inline)
    }

    /// Delay known at enqueue time
    ///
    /// A template reference without an override uses the template's own
    /// delay, which is only known once resolved.
    pub fn delay_hint(&self) -> Option<u64> {
        match self {
            ActionRef::Template { delay_ms, .. } => *delay_ms,
            ActionRef::Inline(a) => Some(a.delay_ms),
        }
    }
}

impl From<Action> for ActionRef {
    fn from(action: Action) -> Self {
        ActionRef::Inline(action)
    }
}
