use crate::core::compiler::CompileOptions;
use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Registry and compiler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Increment between consecutive rule identifiers in a chain
    #[serde(default = "default_rule_id_step")]
    pub rule_id_step: u64,
    /// Name prefix of sets generated while compiling rules
    #[serde(default = "default_anonymous_set_prefix")]
    pub anonymous_set_prefix: String,
    /// Guard IP matches in `inet` tables with a `meta nfproto` compare
    #[serde(default = "default_true")]
    pub inet_family_guard: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rule_id_step: default_rule_id_step(),
            anonymous_set_prefix: default_anonymous_set_prefix(),
            inet_family_guard: true,
        }
    }
}

fn default_rule_id_step() -> u64 {
    10
}

fn default_anonymous_set_prefix() -> String {
    "__set".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Loads a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read, is not valid JSON, or fails
    /// [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Writes the config as pretty JSON, replacing the target atomically.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the temporary file cannot be written or renamed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Defaults overridden by `NFTKIT_RULE_ID_STEP`, `NFTKIT_SET_PREFIX` and
    /// `NFTKIT_INET_GUARD`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a variable is set to a value that does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a variable is set to a value that does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(step) = lookup("NFTKIT_RULE_ID_STEP") {
            config.rule_id_step = step
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("NFTKIT_RULE_ID_STEP: invalid number {step:?}")))?;
        }
        if let Some(prefix) = lookup("NFTKIT_SET_PREFIX") {
            config.anonymous_set_prefix = prefix;
        }
        if let Some(guard) = lookup("NFTKIT_INET_GUARD") {
            config.inet_family_guard = match guard.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(Error::Config(format!(
                        "NFTKIT_INET_GUARD: expected a boolean, got {guard:?}"
                    )));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `Err` for a zero identifier step or an empty set prefix.
    pub fn validate(&self) -> Result<()> {
        if self.rule_id_step == 0 {
            return Err(Error::Config("rule_id_step must be greater than zero".to_string()));
        }
        if self.anonymous_set_prefix.is_empty() {
            return Err(Error::Config("anonymous_set_prefix must not be empty".to_string()));
        }
        if self.rule_id_step == 1 {
            warn!("rule_id_step of 1 leaves no room between identifiers in dumps");
        }
        Ok(())
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            inet_family_guard: self.inet_family_guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.rule_id_step, 10);
        assert_eq!(config.anonymous_set_prefix, "__set");
        assert!(config.inet_family_guard);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "rule_id_step": 100 }}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.rule_id_step, 100);
        assert_eq!(config.anonymous_set_prefix, "__set");
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "rule_id_step": 0 }}"#).unwrap();
        assert!(matches!(Config::load(file.path()), Err(Error::Config(_))));

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        write!(garbage, "not json").unwrap();
        assert!(matches!(Config::load(garbage.path()), Err(Error::Serialization(_))));

        assert!(matches!(Config::load("/nonexistent/nftkit.json"), Err(Error::Io(_))));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nftkit.json");
        let config = Config {
            rule_id_step: 5,
            anonymous_set_prefix: "anon".to_string(),
            inet_family_guard: false,
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
        assert!(!dir.path().join("nftkit.json.tmp").exists());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NFTKIT_RULE_ID_STEP", "20"),
            ("NFTKIT_INET_GUARD", "off"),
        ]
        .into();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.rule_id_step, 20);
        assert!(!config.inet_family_guard);
        assert_eq!(config.anonymous_set_prefix, "__set");

        let bad = Config::from_lookup(|k| (k == "NFTKIT_INET_GUARD").then(|| "maybe".to_string()));
        assert!(matches!(bad, Err(Error::Config(_))));

        let empty = Config::from_lookup(|k| (k == "NFTKIT_SET_PREFIX").then(String::new));
        assert!(empty.is_err());
    }
}
