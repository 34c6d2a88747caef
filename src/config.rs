//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables and policy decisions for a [`crate::engine::TaskEngine`].
///
/// Deserializable so hosts can load it from their own config file; every
/// field has a default so a bare `{ "owner_id": ... }` is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Owner whose tasks this engine materializes.
    pub owner_id: String,
    /// strftime pattern for grouped-view date headers.
    pub date_header_format: String,
    /// Label of the trailing bucket for tasks without a due date.
    pub undated_label: String,
    /// Unfold a collapsed task when its first subtask is added.
    pub auto_expand_on_subtask_add: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner_id: String::new(),
            date_header_format: "%A, %d %B".to_string(),
            undated_label: "Undated".to_string(),
            auto_expand_on_subtask_add: true,
        }
    }
}

impl EngineConfig {
    pub fn for_owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{ "owner_id": "u1" }"#).unwrap();
        assert_eq!(cfg.owner_id, "u1");
        assert_eq!(cfg.undated_label, "Undated");
        assert!(cfg.auto_expand_on_subtask_add);
    }
}
