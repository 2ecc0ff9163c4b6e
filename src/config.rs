use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{wlog_debug, Error, Result};

pub const DEFAULT_MAX_SWAPS: u32 = 2;
pub const DEFAULT_OUTPUT_BUFFER_CHARS: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Argv prefix for task-execution workers. The spec id and task flags
    /// are appended.
    pub worker_command: Vec<String>,
    /// Argv prefix for spec-creation workers.
    pub spec_command: Vec<String>,
    pub auto_switch: AutoSwitchSettings,
    pub supervisor: SupervisorSettings,
    pub active_profile: Option<String>,
    pub profiles: Vec<ProfileConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_command: vec!["python3".to_string(), "run.py".to_string()],
            spec_command: vec!["python3".to_string(), "spec_runner.py".to_string()],
            auto_switch: AutoSwitchSettings::default(),
            supervisor: SupervisorSettings::default(),
            active_profile: None,
            profiles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSwitchSettings {
    pub enabled: bool,
    pub on_rate_limit: bool,
    pub on_auth_failure: bool,
    pub on_billing_failure: bool,
}

impl Default for AutoSwitchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            on_rate_limit: true,
            on_auth_failure: true,
            on_billing_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub max_swaps: u32,
    pub output_buffer_chars: usize,
    pub kill_grace_ms: u64,
    pub kill_all_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub cleanup_delay_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_swaps: DEFAULT_MAX_SWAPS,
            output_buffer_chars: DEFAULT_OUTPUT_BUFFER_CHARS,
            kill_grace_ms: 5_000,
            kill_all_timeout_ms: 10_000,
            restart_delay_ms: 500,
            cleanup_delay_ms: 1_000,
        }
    }
}

impl SupervisorSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn kill_all_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_all_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    #[default]
    Oauth,
    ApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: ProfileKind,
    pub config_dir: Option<String>,
    pub token: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub authenticated: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            kind: ProfileKind::default(),
            config_dir: None,
            token: None,
            api_key: None,
            authenticated: true,
            env: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn warden_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".warden"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::warden_dir()?.join("warden.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        wlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            wlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        wlog_debug!(
            "Config loaded: auto_switch={} max_swaps={} profiles={}",
            config.auto_switch.enabled,
            config.supervisor.max_swaps,
            config.profiles.len()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::warden_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        wlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_command.is_empty() {
            return Err(Error::Validation(
                "worker_command cannot be empty".to_string(),
            ));
        }
        if self.spec_command.is_empty() {
            return Err(Error::Validation("spec_command cannot be empty".to_string()));
        }
        if let Some(active) = &self.active_profile {
            if !self.profiles.iter().any(|p| &p.id == active) {
                return Err(Error::ProfileNotFound(active.clone()));
            }
        }
        Ok(())
    }
}
