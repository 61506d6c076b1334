use serde_json::Value;

/// Process-wide switch for the auto-controller heartbeat.
/// Unknown means enabled (fail-open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSetting {
    pub enabled: bool,
}

impl Default for ControllerSetting {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ControllerSetting {
    pub fn from_record(record: &Value) -> Self {
        let enabled = record
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        Self { enabled }
    }
}
