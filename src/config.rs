//! Start-up configuration, read once from the environment.
//!
//! - `LIBRARYD_LOG` -- tracing filter directive (default `info`; `RUST_LOG`
//!   takes precedence when set)
//! - `LIBRARYD_WORKSPACE` -- workspace directory to open before the first
//!   request (optional)

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub workspace: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let log_filter = lookup("LIBRARYD_LOG")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "info".to_owned());
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&log_filter) {
            return Err(ConfigError::Invalid {
                key: "LIBRARYD_LOG",
                reason: e.to_string(),
            });
        }

        let workspace = match lookup("LIBRARYD_WORKSPACE") {
            None => None,
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => {
                let p = PathBuf::from(raw.trim());
                if p.exists() && !p.is_dir() {
                    return Err(ConfigError::Invalid {
                        key: "LIBRARYD_WORKSPACE",
                        reason: format!("{} is not a directory", p.display()),
                    });
                }
                Some(p)
            }
        };

        Ok(Self {
            log_filter,
            workspace,
        })
    }
}
