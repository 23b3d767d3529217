//! Bridge configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Default name of the guest capability table
pub const DEFAULT_NAMESPACE: &str = "moonsh";

/// Configuration shared by every session a [`Bridge`](crate::Bridge) creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name of the global table holding the capability namespace
    pub namespace: String,
    /// Directories whose `*.lua` files run at startup, in lexical order
    pub script_dirs: Vec<PathBuf>,
    /// Extra startup scripts, run after the directories
    pub startup_files: Vec<PathBuf>,
    /// Whether startup scripts run at all
    pub load_startup: bool,
    /// Hook invocations slower than this are logged (zero disables)
    #[serde(with = "duration_ms")]
    pub slow_hook_threshold: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            script_dirs: Vec::new(),
            startup_files: Vec::new(),
            load_startup: true,
            slow_hook_threshold: Duration::from_millis(500),
        }
    }
}

impl BridgeConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the namespace is a usable guest identifier.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let mut chars = self.namespace.chars();
        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(BridgeError::Config(format!(
                "namespace {:?} is not a valid identifier",
                self.namespace
            )));
        }
        Ok(())
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.namespace, "moonsh");
        assert!(config.load_startup);
        assert!(config.script_dirs.is_empty());
        assert_eq!(config.slow_hook_threshold, Duration::from_millis(500));
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig {
            namespace: "nyagos".into(),
            script_dirs: vec!["/etc/moonsh.d".into()],
            startup_files: vec![],
            load_startup: false,
            slow_hook_threshold: Duration::from_secs(2),
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"slow_hook_threshold\":2000"));
        let back: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BridgeConfig = serde_json::from_str(r#"{"load_startup": false}"#).unwrap();
        assert!(!config.load_startup);
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"namespace": "sh", "slow_hook_threshold": 0}}"#).unwrap();

        let config = BridgeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.namespace, "sh");
        assert_eq!(config.slow_hook_threshold, Duration::ZERO);
    }

    #[test]
    fn test_invalid_namespace_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"namespace": "1bad name"}}"#).unwrap();

        let err = BridgeConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
