//! Worker environment assembly.
//!
//! Layers, lowest priority first:
//!
//! 1. the supervisor's own environment, with common tool directories
//!    appended to `PATH`
//! 2. discovered tool paths (`git`, `gh`, `claude`)
//! 3. per-spawn overrides from the caller
//! 4. the active profile's credentials
//! 5. fixed runtime flags that keep worker output unbuffered and UTF-8
//!
//! A profile that authenticates through a config directory also blanks
//! any direct OAuth token, which would otherwise take precedence inside
//! the worker.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::profiles::{ProfileStore, CLAUDE_CONFIG_DIR, CLAUDE_CODE_OAUTH_TOKEN};
use crate::{util, wlog_debug, Result};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

const RUNTIME_FLAGS: &[(&str, &str)] = &[
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONUTF8", "1"),
];

/// Tools workers shell out to, and the variable each path is exported as.
const TOOLS: &[(&str, &str)] = &[
    ("git", "WARDEN_GIT_PATH"),
    ("gh", "WARDEN_GH_PATH"),
    ("claude", "CLAUDE_CLI_PATH"),
];

fn extra_path_dirs() -> Vec<PathBuf> {
    let mut extra = vec![PathBuf::from("/usr/local/bin"), PathBuf::from("/opt/homebrew/bin")];
    if let Some(home) = dirs::home_dir() {
        extra.push(home.join(".local/bin"));
    }
    extra
}

/// The current process environment with `PATH` augmented.
pub fn base_environment() -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    let current = env.get("PATH").cloned().unwrap_or_default();
    let mut entries: Vec<PathBuf> = std::env::split_paths(&current).collect();
    for dir in extra_path_dirs() {
        if !entries.contains(&dir) && dir.is_dir() {
            entries.push(dir);
        }
    }
    if let Ok(joined) = std::env::join_paths(entries) {
        env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
    }
    env
}

/// Resolve tool paths with `which`. Missing tools are simply left out.
pub fn discover_tools() -> BTreeMap<String, String> {
    TOOLS
        .iter()
        .filter_map(|(tool, var)| {
            which::which(tool)
                .ok()
                .map(|path| (var.to_string(), path.to_string_lossy().into_owned()))
        })
        .collect()
}

/// Merge the layers in priority order.
pub fn assemble_env(
    base: BTreeMap<String, String>,
    tools: BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
    profile_env: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let uses_config_dir = profile_env.contains_key(CLAUDE_CONFIG_DIR);
    let mut env = base;
    env.extend(tools);
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(profile_env);
    if uses_config_dir {
        env.insert(CLAUDE_CODE_OAUTH_TOKEN.to_string(), String::new());
    }
    for (key, value) in RUNTIME_FLAGS {
        env.insert(key.to_string(), value.to_string());
    }
    env
}

/// Full environment for a worker run under the active profile.
pub async fn build_worker_env(
    profiles: &dyn ProfileStore,
    overrides: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let profile_env = match profiles.active_profile().await {
        Some(profile) => {
            wlog_debug!("worker env uses profile {}", profile.id);
            profiles.profile_env(&profile.id).await?
        }
        None => BTreeMap::new(),
    };
    let (base, tools) = util::blocking_with_timeout(DISCOVERY_TIMEOUT, || {
        Ok((base_environment(), discover_tools()))
    })
    .await?;
    Ok(assemble_env(base, tools, overrides, profile_env))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_priority_order() {
        let env = assemble_env(
            map(&[("A", "base"), ("B", "base"), ("C", "base"), ("PYTHONUNBUFFERED", "0")]),
            map(&[("B", "tool")]),
            &map(&[("C", "override"), ("D", "override")]),
            map(&[("D", "profile")]),
        );
        assert_eq!(env["A"], "base");
        assert_eq!(env["B"], "tool");
        assert_eq!(env["C"], "override");
        assert_eq!(env["D"], "profile");
        assert_eq!(env["PYTHONUNBUFFERED"], "1");
        assert_eq!(env["PYTHONUTF8"], "1");
    }

    #[test]
    fn test_config_dir_profile_blanks_token() {
        let env = assemble_env(
            map(&[(CLAUDE_CODE_OAUTH_TOKEN, "inherited")]),
            BTreeMap::new(),
            &map(&[(CLAUDE_CODE_OAUTH_TOKEN, "override")]),
            map(&[(CLAUDE_CONFIG_DIR, "/profiles/work")]),
        );
        assert_eq!(env[CLAUDE_CONFIG_DIR], "/profiles/work");
        assert_eq!(env[CLAUDE_CODE_OAUTH_TOKEN], "");
    }

    #[test]
    fn test_token_profile_keeps_token() {
        let env = assemble_env(
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
            map(&[(CLAUDE_CODE_OAUTH_TOKEN, "tok")]),
        );
        assert_eq!(env[CLAUDE_CODE_OAUTH_TOKEN], "tok");
    }

    #[test]
    fn test_base_environment_keeps_path() {
        let env = base_environment();
        assert!(env.contains_key("PATH"));
    }
}
