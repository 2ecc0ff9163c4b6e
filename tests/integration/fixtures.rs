//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary projects with a spec directory
//! - Worker scripts that emit protocol lines
//! - Orchestrators wired to a notification receiver

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

use warden::config::{Config, ProfileConfig};
use warden::locator::{SpecLocator, PLAN_FILE_NAME};
use warden::profiles::ConfigProfileStore;
use warden::protocol::TASK_EVENT_MARKER;
use warden::{Notification, Notifier, Orchestrator};

pub const SPEC_ID: &str = "001-add-login";

/// A temporary project containing one spec directory.
pub struct TestProject {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        std::fs::create_dir_all(SpecLocator::new(&path).spec_dir(SPEC_ID))
            .expect("Failed to create spec directory");
        Self { temp_dir, path }
    }

    pub fn plan_path(&self) -> PathBuf {
        SpecLocator::new(&self.path)
            .spec_dir(SPEC_ID)
            .join(PLAN_FILE_NAME)
    }

    /// The plan file as raw JSON.
    pub fn plan(&self) -> Value {
        let text = std::fs::read_to_string(self.plan_path()).expect("plan file missing");
        serde_json::from_str(&text).expect("plan file is not JSON")
    }

    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.path.join(name)).unwrap_or_default()
    }
}

/// A task event line as the worker prints it.
pub fn event_line(task_id: &str, event_type: &str, sequence: u64, extra: Value) -> String {
    let mut event = json!({
        "type": event_type,
        "taskId": task_id,
        "specId": SPEC_ID,
        "projectId": "test-project",
        "timestamp": "2026-03-01T10:00:00Z",
        "eventId": format!("{}-{}", event_type.to_lowercase(), sequence),
        "sequence": sequence,
    });
    if let (Some(map), Value::Object(extra)) = (event.as_object_mut(), extra) {
        map.extend(extra);
    }
    format!("{}{}", TASK_EVENT_MARKER, event)
}

/// Shell that echoes each line verbatim, then runs `tail`.
pub fn echo_script(lines: &[String], tail: &str) -> String {
    let mut script = String::new();
    for line in lines {
        script.push_str(&format!("echo '{}'\n", line));
    }
    script.push_str(tail);
    script
}

pub fn profile(id: &str, authenticated: bool) -> ProfileConfig {
    ProfileConfig {
        id: id.to_string(),
        name: id.to_uppercase(),
        config_dir: Some(format!("/tmp/warden-test-{}", id)),
        authenticated,
        ..ProfileConfig::default()
    }
}

/// Config running `script` with `sh -c` and short supervisor delays.
pub fn config(script: &str, profiles: Vec<ProfileConfig>) -> Config {
    let mut config = Config::default();
    config.worker_command = vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        "worker".to_string(),
    ];
    config.spec_command = config.worker_command.clone();
    config.supervisor.restart_delay_ms = 20;
    config.supervisor.cleanup_delay_ms = 20;
    config.supervisor.kill_grace_ms = 1_000;
    config.active_profile = profiles.first().map(|p| p.id.clone());
    config.profiles = profiles;
    config
}

pub fn orchestrator(config: Config) -> (Orchestrator, mpsc::UnboundedReceiver<Notification>) {
    let profiles = Arc::new(ConfigProfileStore::from_config(&config));
    let (notifier, rx) = Notifier::channel();
    (Orchestrator::new(config, profiles, notifier), rx)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

/// Run the orchestrator until idle, failing the test if it hangs.
pub async fn settle(orchestrator: &mut Orchestrator) {
    tokio::time::timeout(Duration::from_secs(20), orchestrator.run_until_idle())
        .await
        .expect("orchestrator did not go idle");
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
