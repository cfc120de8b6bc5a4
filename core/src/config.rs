//! Layered engine configuration: built-in defaults, an optional on-disk
//! `config.toml`, environment-variable overrides, then explicit
//! constructor arguments — each layer overriding the previous one, mirroring
//! the teacher's `Config`/`ConfigToml` split.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::flags;
use crate::openai_model_info::get_model_info;
use crate::protocol::ApprovalPolicy;

const DEFAULT_MODEL: &str = "codex-mini-latest";

/// The subset of `config.toml` the engine itself reads. Everything else in
/// a real on-disk config (instructions files, UI preferences, MCP server
/// lists, ...) belongs to the out-of-scope front end.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigToml {
    pub model: Option<String>,
    pub approval_policy: Option<ApprovalPolicy>,
    pub writable_roots: Option<Vec<PathBuf>>,
}

impl ConfigToml {
    /// Reads and parses `path`; a missing file is treated as an empty
    /// config rather than an error, since the file is entirely optional.
    pub fn load_from_toml(path: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}

/// The resolved configuration the engine actually reads from.
#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub approval_policy: ApprovalPolicy,
    pub writable_roots: Vec<PathBuf>,
    pub request_timeout: Duration,
    pub rate_limit_retry_base: Duration,
    pub api_key: Option<String>,
    pub base_url: String,
}

/// Explicit overrides passed to the constructor; these win over every
/// other layer. `None` means "defer to config.toml / env / defaults".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub approval_policy: Option<ApprovalPolicy>,
    pub writable_roots: Option<Vec<PathBuf>>,
}

impl Config {
    /// Resolves the full precedence chain: defaults < `config_toml` <
    /// environment variables < `overrides`.
    pub fn load(config_toml: ConfigToml, overrides: ConfigOverrides) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let mut writable_roots = vec![cwd, std::env::temp_dir()];
        if let Some(roots) = config_toml.writable_roots {
            writable_roots = roots;
        }
        if let Some(roots) = overrides.writable_roots {
            writable_roots = roots;
        }

        let model = overrides
            .model
            .or(config_toml.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let approval_policy = overrides
            .approval_policy
            .or(config_toml.approval_policy)
            .unwrap_or_default();

        Config {
            request_timeout: *flags::OPENAI_TIMEOUT_MS,
            rate_limit_retry_base: *flags::OPENAI_RATE_LIMIT_RETRY_WAIT_MS,
            api_key: flags::OPENAI_API_KEY.map(str::to_string),
            base_url: flags::OPENAI_BASE_URL.to_string(),
            model,
            approval_policy,
            writable_roots,
        }
    }

    /// Context window for the configured model, when known, used to render
    /// a more specific `ContextWindowExceeded` message than "too long".
    pub fn context_window_tokens(&self) -> Option<u64> {
        get_model_info(&self.model).map(|info| info.context_window)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn overrides_win_over_config_toml() {
        let toml = ConfigToml {
            model: Some("from-toml".to_string()),
            approval_policy: Some(ApprovalPolicy::Suggest),
            writable_roots: None,
        };
        let overrides = ConfigOverrides {
            model: Some("from-override".to_string()),
            approval_policy: Some(ApprovalPolicy::FullAuto),
            writable_roots: None,
        };
        let config = Config::load(toml, overrides);
        assert_eq!(config.model, "from-override");
        assert_eq!(config.approval_policy, ApprovalPolicy::FullAuto);
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = Config::load(ConfigToml::default(), ConfigOverrides::default());
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.approval_policy, ApprovalPolicy::Suggest);
        assert!(!config.writable_roots.is_empty());
    }

    #[test]
    fn missing_config_file_is_not_an_error() {
        let config = ConfigToml::load_from_toml(Path::new("/nonexistent/config.toml")).unwrap();
        assert!(config.model.is_none());
    }

    #[test]
    fn context_window_known_for_default_model() {
        let config = Config::load(ConfigToml::default(), ConfigOverrides::default());
        assert_eq!(config.context_window_tokens(), Some(200_000));
    }

    #[test]
    fn context_window_unknown_for_unrecognized_model() {
        let config = Config::load(
            ConfigToml::default(),
            ConfigOverrides {
                model: Some("some-future-model".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(config.context_window_tokens(), None);
    }
}
