use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{P2PError, P2PResult};

pub const DEFAULT_CHANNEL_LABEL: &str = "messenger";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_LOG_FILTER: &str = "p2p_rtc=info";

const ENV_PREFIX: &str = "P2P_RTC_";

/// What happens to application messages sent before the peer's key arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreKeyPolicy {
    /// Hold them in the session outbox and send them encrypted once keyed.
    #[default]
    Queue,
    /// Send them immediately as plain payloads.
    Plaintext,
}

impl FromStr for PreKeyPolicy {
    type Err = P2PError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queue" => Ok(PreKeyPolicy::Queue),
            "plaintext" | "plain" => Ok(PreKeyPolicy::Plaintext),
            other => Err(P2PError::Config(format!(
                "Invalid pre-key policy: {}. Use queue or plaintext",
                other
            ))),
        }
    }
}

impl fmt::Display for PreKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreKeyPolicy::Queue => write!(f, "queue"),
            PreKeyPolicy::Plaintext => write!(f, "plaintext"),
        }
    }
}

/// Session manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Label of the data channel opened by the caller
    pub channel_label: String,
    pub pre_key_policy: PreKeyPolicy,
    /// Largest attachment `send_file` accepts, in bytes
    pub max_file_size: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            pre_key_policy: PreKeyPolicy::Queue,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn with_policy(mut self, policy: PreKeyPolicy) -> Self {
        self.pre_key_policy = policy;
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> P2PResult<()> {
        if self.channel_label.trim().is_empty() {
            return Err(P2PError::Config("channel label cannot be empty".to_string()));
        }
        // Labels are limited to 65535 bytes on the wire.
        if self.channel_label.len() > u16::MAX as usize {
            return Err(P2PError::Config("channel label is too long".to_string()));
        }
        if self.max_file_size == 0 {
            return Err(P2PError::Config("max file size cannot be 0".to_string()));
        }
        Ok(())
    }
}

/// Configuration of the command-line client
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_dir: PathBuf,
    pub display_name: String,
    pub log_filter: String,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Build the configuration from the process environment.
    ///
    /// A `.env` in the working directory is loaded first, then one in the
    /// platform config directory; variables already set win over both.
    pub fn from_env() -> P2PResult<Self> {
        dotenv::dotenv().ok();
        if let Some(dirs) = project_dirs() {
            let env_path = dirs.config_dir().join(".env");
            if env_path.exists() {
                let _ = dotenv::from_path(env_path);
            }
        }

        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from `P2P_RTC_*` variables supplied by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> P2PResult<Self> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        let config_dir = match var("CONFIG_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => project_dirs()
                .map(|dirs| dirs.config_dir().to_path_buf())
                .ok_or_else(|| {
                    P2PError::Config("no home directory; set P2P_RTC_CONFIG_DIR".to_string())
                })?,
        };

        let mut session = SessionConfig::default();
        if let Some(label) = var("CHANNEL_LABEL") {
            session.channel_label = label;
        }
        if let Some(policy) = var("PRE_KEY_POLICY") {
            session.pre_key_policy = policy.parse()?;
        }
        if let Some(size) = var("MAX_FILE_SIZE") {
            session.max_file_size = size.trim().parse().map_err(|_| {
                P2PError::Config(format!("Invalid max file size: {}", size))
            })?;
        }

        let config = Self {
            config_dir,
            display_name: var("DISPLAY_NAME").unwrap_or_else(|| "anonymous".to_string()),
            log_filter: var("LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            session,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> P2PResult<()> {
        if self.display_name.trim().is_empty() {
            return Err(P2PError::Config("display name cannot be empty".to_string()));
        }
        self.session.validate()
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "p2p-rtc", "p2p-rtc")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_session_config() {
        let config = SessionConfig::default();
        assert_eq!(config.pre_key_policy, PreKeyPolicy::Queue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_session_config() {
        assert!(SessionConfig::default().with_max_file_size(0).validate().is_err());

        let config = SessionConfig {
            channel_label: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(P2PError::Config(_))));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("QUEUE".parse::<PreKeyPolicy>().unwrap(), PreKeyPolicy::Queue);
        assert_eq!("plain".parse::<PreKeyPolicy>().unwrap(), PreKeyPolicy::Plaintext);
        assert!("sometimes".parse::<PreKeyPolicy>().is_err());
        assert_eq!(PreKeyPolicy::Plaintext.to_string(), "plaintext");
    }

    #[test]
    fn test_app_config_from_variables() {
        let config = AppConfig::from_lookup(lookup(&[
            ("P2P_RTC_CONFIG_DIR", "/tmp/p2p-rtc-test"),
            ("P2P_RTC_DISPLAY_NAME", "alice"),
            ("P2P_RTC_PRE_KEY_POLICY", "plaintext"),
            ("P2P_RTC_MAX_FILE_SIZE", "1024"),
        ]))
        .unwrap();

        assert_eq!(config.config_dir, PathBuf::from("/tmp/p2p-rtc-test"));
        assert_eq!(config.display_name, "alice");
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
        assert_eq!(config.session.pre_key_policy, PreKeyPolicy::Plaintext);
        assert_eq!(config.session.max_file_size, 1024);
    }

    #[test]
    fn test_app_config_rejects_bad_values() {
        let result = AppConfig::from_lookup(lookup(&[
            ("P2P_RTC_CONFIG_DIR", "/tmp/p2p-rtc-test"),
            ("P2P_RTC_MAX_FILE_SIZE", "lots"),
        ]));
        assert!(matches!(result, Err(P2PError::Config(_))));
    }
}
