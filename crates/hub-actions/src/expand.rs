//! Text helpers shared by the executor and the watcher

use hub_variables::VariableStore;

/// Bound on captured action output
pub const MAX_OUTPUT_LEN: usize = 1024;

/// Replace every `${name}` with the formatted value of variable `name`
///
/// Unknown variables expand to the empty string. An unterminated `${` is
/// kept literally.
pub fn expand_variables(template: &str, vars: &VariableStore) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = after[..end].trim();
                if let Ok(value) = vars.get(name) {
                    out.push_str(&value.to_string());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// File-name-safe tag derived from a command name
pub fn safe_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(20)
        .collect();
    if safe.is_empty() {
        "cmd".to_string()
    } else {
        safe
    }
}

pub fn nohup_log_file(safe: &str) -> String {
    format!("/tmp/ts_nohup_{safe}.log")
}

/// Detach a command from the session, logging to [`nohup_log_file`]
pub fn nohup_wrap(command: &str, safe: &str) -> String {
    format!("nohup {command} > /tmp/ts_nohup_{safe}.log 2>&1 & echo $! > /tmp/ts_nohup_{safe}.pid")
}

/// Cut output to [`MAX_OUTPUT_LEN`] bytes on a char boundary
pub fn bound_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_LEN {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
