//! Credential profiles.
//!
//! The supervisor only needs a handful of queries from whatever owns the
//! user's credential profiles, so that owner sits behind [`ProfileStore`].
//! [`ConfigProfileStore`] is the implementation backed by `config.toml`.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::config::{Config, ProfileConfig, ProfileKind};
use crate::{wlog, Error, Result};

pub const CLAUDE_CONFIG_DIR: &str = "CLAUDE_CONFIG_DIR";
pub const CLAUDE_CODE_OAUTH_TOKEN: &str = "CLAUDE_CODE_OAUTH_TOKEN";
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    pub id: String,
    pub name: String,
}

impl From<&ProfileConfig> for ProfileSummary {
    fn from(p: &ProfileConfig) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
        }
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn active_profile(&self) -> Option<ProfileSummary>;

    /// Best profile other than `exclude`. With `require_authenticated`, only
    /// profiles with working credentials qualify.
    async fn best_alternate(
        &self,
        exclude: &str,
        require_authenticated: bool,
    ) -> Option<ProfileSummary>;

    async fn set_active(&self, profile_id: &str) -> Result<()>;

    /// Environment variables that make a worker use `profile_id`.
    async fn profile_env(&self, profile_id: &str) -> Result<BTreeMap<String, String>>;

    async fn record_rate_limit_event(&self, profile_id: &str, reset_time: Option<&str>);
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Worker environment for one profile.
pub fn env_for_profile(profile: &ProfileConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    match profile.kind {
        ProfileKind::Oauth => {
            if let Some(dir) = &profile.config_dir {
                env.insert(
                    CLAUDE_CONFIG_DIR.to_string(),
                    expand_tilde(dir).to_string_lossy().into_owned(),
                );
            } else if let Some(token) = &profile.token {
                env.insert(CLAUDE_CODE_OAUTH_TOKEN.to_string(), token.clone());
            }
        }
        ProfileKind::ApiKey => {
            if let Some(key) = &profile.api_key {
                env.insert(ANTHROPIC_API_KEY.to_string(), key.clone());
            }
        }
    }
    env.extend(profile.env.clone());
    env
}

#[derive(Debug, Default)]
struct StoreState {
    active: Option<String>,
    rate_limit_events: HashMap<String, u32>,
}

pub struct ConfigProfileStore {
    profiles: Vec<ProfileConfig>,
    state: Mutex<StoreState>,
}

impl ConfigProfileStore {
    pub fn new(profiles: Vec<ProfileConfig>, active: Option<String>) -> Self {
        let active = active.or_else(|| profiles.first().map(|p| p.id.clone()));
        Self {
            profiles,
            state: Mutex::new(StoreState {
                active,
                rate_limit_events: HashMap::new(),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.profiles.clone(), config.active_profile.clone())
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find(&self, profile_id: &str) -> Option<&ProfileConfig> {
        self.profiles.iter().find(|p| p.id == profile_id)
    }

    pub fn rate_limit_events(&self, profile_id: &str) -> u32 {
        self.state()
            .rate_limit_events
            .get(profile_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProfileStore for ConfigProfileStore {
    async fn active_profile(&self) -> Option<ProfileSummary> {
        let active = self.state().active.clone()?;
        self.find(&active).map(ProfileSummary::from)
    }

    async fn best_alternate(
        &self,
        exclude: &str,
        require_authenticated: bool,
    ) -> Option<ProfileSummary> {
        let state = self.state();
        // Fewest recorded rate-limit hits first; config order breaks ties.
        self.profiles
            .iter()
            .filter(|p| p.id != exclude)
            .filter(|p| !require_authenticated || p.authenticated)
            .min_by_key(|p| state.rate_limit_events.get(&p.id).copied().unwrap_or(0))
            .map(ProfileSummary::from)
    }

    async fn set_active(&self, profile_id: &str) -> Result<()> {
        if self.find(profile_id).is_none() {
            return Err(Error::ProfileNotFound(profile_id.to_string()));
        }
        self.state().active = Some(profile_id.to_string());
        wlog!("active profile set to {}", profile_id);
        Ok(())
    }

    async fn profile_env(&self, profile_id: &str) -> Result<BTreeMap<String, String>> {
        self.find(profile_id)
            .map(env_for_profile)
            .ok_or_else(|| Error::ProfileNotFound(profile_id.to_string()))
    }

    async fn record_rate_limit_event(&self, profile_id: &str, reset_time: Option<&str>) {
        *self
            .state()
            .rate_limit_events
            .entry(profile_id.to_string())
            .or_insert(0) += 1;
        wlog!(
            "rate limit recorded for profile {} (resets {})",
            profile_id,
            reset_time.unwrap_or("unknown")
        );
    }
}
