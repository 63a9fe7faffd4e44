//! Orchestrator configuration (TOML, optional).
//!
//! Defaults reproduce the shipped policy exactly; a config file only needs
//! the fields it overrides.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// First-token allowlist for `cmd` steps.
    pub command_allowlist: Vec<String>,

    /// Package-manager basenames that trigger the dependency decision gate.
    pub dependency_basenames: Vec<String>,

    /// Model name sent to the completion endpoint.
    pub model: String,

    /// Maximum number of steps a plan may carry.
    pub max_plan_steps: usize,

    /// When false, the precheck-hit heuristic never classifies a
    /// suspicious result as `no_op`.
    pub no_op_detection: bool,

    /// Optional file hint appended to the retry instruction prompt.
    pub retry_focus_hint: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            command_allowlist: vec!["git".to_string()],
            dependency_basenames: vec![
                "package.json".to_string(),
                "package-lock.json".to_string(),
                "yarn.lock".to_string(),
                "pnpm-lock.yaml".to_string(),
            ],
            model: "gpt-4o-mini".to_string(),
            max_plan_steps: 8,
            no_op_detection: true,
            retry_focus_hint: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_allowlist.is_empty()
            || self.command_allowlist.iter().any(|t| t.trim().is_empty())
        {
            return Err(anyhow!("command_allowlist must be a non-empty token list"));
        }
        if self.max_plan_steps == 0 {
            return Err(anyhow!("max_plan_steps must be > 0"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let config: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_policy() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.command_allowlist, vec!["git"]);
        assert_eq!(config.max_plan_steps, 8);
        assert!(config.no_op_detection);
        assert!(config.dependency_basenames.contains(&"yarn.lock".to_string()));
        config.validate().expect("defaults validate");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = load_config(&temp.path().join("absent.toml")).expect("load");
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_plan_steps = 4\nno_op_detection = false\n").expect("write");
        let config = load_config(&path).expect("load");
        assert_eq!(config.max_plan_steps, 4);
        assert!(!config.no_op_detection);
        assert_eq!(config.command_allowlist, vec!["git"]);
    }

    #[test]
    fn rejects_empty_allowlist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "command_allowlist = []\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
