//! Wire shape of setup step descriptors.
//!
//! Provisioning requests carry setup steps as a JSON array. This module only
//! deals with the JSON shape and its defaults; the daemon turns each
//! descriptor into a runnable step.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default expected exit code.
pub const DEFAULT_EXPECTED_EXIT_CODE: i32 = 0;

/// Default per-step timeout in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: i64 = 300;

fn default_timeout() -> i64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

/// One entry of a setup step array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStepDescriptor {
    pub step_order: i32,
    #[serde(default)]
    pub title: String,
    pub setup_command: String,
    #[serde(default)]
    pub expected_exit_code: i32,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub continue_on_failure: bool,
}

/// Returns true when a descriptor payload carries no steps at all.
pub fn is_empty_descriptor(json: &str) -> bool {
    let trimmed = json.trim();
    trimmed.is_empty() || trimmed == "[]" || trimmed == "null"
}

/// Parses a JSON array of descriptors. Empty payloads yield no steps.
pub fn parse_descriptors(json: &str) -> Result<Vec<SetupStepDescriptor>> {
    if is_empty_descriptor(json) {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_defaults_applied() {
        let json = r#"[{"stepOrder":1,"title":"Update","setupCommand":"apt-get update"}]"#;
        let steps = parse_descriptors(json).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].expected_exit_code, DEFAULT_EXPECTED_EXIT_CODE);
        assert_eq!(steps[0].timeout_seconds, DEFAULT_STEP_TIMEOUT_SECS);
        assert!(!steps[0].continue_on_failure);
    }

    #[test]
    fn test_explicit_values() {
        let json = r#"[{
            "stepOrder": 3,
            "title": "Check missing file",
            "setupCommand": "test -f /missing",
            "expectedExitCode": 1,
            "timeoutSeconds": 10,
            "continueOnFailure": true
        }]"#;
        let step = &parse_descriptors(json).unwrap()[0];
        assert_eq!(step.step_order, 3);
        assert_eq!(step.expected_exit_code, 1);
        assert_eq!(step.timeout_seconds, 10);
        assert!(step.continue_on_failure);
    }

    #[test]
    fn test_empty_payloads() {
        assert!(parse_descriptors("").unwrap().is_empty());
        assert!(parse_descriptors("   ").unwrap().is_empty());
        assert!(parse_descriptors("[]").unwrap().is_empty());
        assert!(parse_descriptors("null").unwrap().is_empty());
    }

    #[test]
    fn test_missing_command_rejected() {
        let result = parse_descriptors(r#"[{"stepOrder":1,"title":"x"}]"#);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }
}
