use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What to do when the two stores disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DivergencePolicy {
    /// Abort the process on the first divergence.
    FailFast,
    /// Log and count mismatches, keep serving. Asymmetric results still abort.
    DiagnosticOnly,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mirror: MirrorConfig,
    pub fuse: FuseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub policy: DivergencePolicy,
    pub max_open_handles: usize,
    pub trace_operations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    pub allow_other: bool,
    pub allow_root: bool,
    pub fsname: String,
    pub auto_unmount: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Config {
    /// Load `mirrorfs.{toml,json,yaml}` from the working directory if present,
    /// or `path` when given, then `MIRRORFS__SECTION__KEY` environment
    /// variables on top.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("mirrorfs").required(false)),
        };

        let config = builder
            .add_source(
                config::Environment::with_prefix("MIRRORFS").separator("__").try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self { policy: DivergencePolicy::FailFast, max_open_handles: 1024, trace_operations: true }
    }
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            allow_other: false,
            allow_root: false,
            fsname: "mirrorfs".to_string(),
            auto_unmount: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "mirrorfs=info".to_string(), json: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.mirror.policy, DivergencePolicy::FailFast);
        assert_eq!(config.mirror.max_open_handles, 1024);
        assert!(config.mirror.trace_operations);

        assert!(!config.fuse.allow_other);
        assert!(!config.fuse.allow_root);
        assert_eq!(config.fuse.fsname, "mirrorfs");

        assert_eq!(config.logging.filter, "mirrorfs=info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"policy\":\"fail-fast\""));
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let json = r#"{
            "mirror": {
                "policy": "diagnostic-only",
                "max_open_handles": 16
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.mirror.policy, DivergencePolicy::DiagnosticOnly);
        assert_eq!(config.mirror.max_open_handles, 16);
        assert!(config.mirror.trace_operations);
        assert_eq!(config.fuse.fsname, "mirrorfs");
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let json = r#"{ "mirror": { "policy": "ignore" } }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirrorfs.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[mirror]\npolicy = \"diagnostic-only\"\ntrace_operations = false").unwrap();
        writeln!(file, "[fuse]\nallow_other = true").unwrap();
        drop(file);

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.mirror.policy, DivergencePolicy::DiagnosticOnly);
        assert!(!config.mirror.trace_operations);
        assert_eq!(config.mirror.max_open_handles, 1024);
        assert!(config.fuse.allow_other);
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(Config::load_from(Some(&missing)).is_err());
    }
}
