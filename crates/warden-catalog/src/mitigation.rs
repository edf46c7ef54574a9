//! Mitigation registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One mitigation entry, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mitigation {
    /// Human-readable name.
    pub name: String,
    /// Textual effectiveness hint.
    #[serde(default)]
    pub description: String,
    /// Technique identifiers this mitigation applies to.
    #[serde(default)]
    pub applies_to: Vec<String>,
}

/// On-disk shape of `mitigations.json`: a single document mapping
/// `mitigation_id -> Mitigation`.
pub type MitigationFile = BTreeMap<String, Mitigation>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mitigation_file_parse() {
        let raw = r#"{
            "SAFE-M-11": {
                "name": "Tool description sanitization",
                "description": "Strip instruction-like content from tool metadata",
                "applies_to": ["SAFE-T1102"]
            },
            "SAFE-M-20": {
                "name": "Path canonicalization",
                "applies_to": ["SAFE-T1105"]
            }
        }"#;

        let parsed: MitigationFile = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed["SAFE-M-11"].applies_to,
            vec!["SAFE-T1102".to_string()]
        );
        assert!(parsed["SAFE-M-20"].description.is_empty());
    }
}
