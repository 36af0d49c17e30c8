//! The persisted app record and its status/mode enums.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

pub const NAME_MIN_LEN: usize = 2;
pub const NAME_MAX_LEN: usize = 100;

/// Exit code recorded when the command could not be started.
pub const EXIT_CODE_SPAWN_FAILED: i32 = 255;
/// Exit code recorded for any app stopped through `kill`.
pub const EXIT_CODE_KILLED: i32 = 137;

/// Whether an app is relaunched by the on-boot scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Once,
    OnBoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Starting,
    Running,
    Success,
    Failed,
}

impl AppStatus {
    /// Sort priority used by listings: actionable apps first.
    pub fn priority(self) -> u8 {
        match self {
            AppStatus::Starting => 0,
            AppStatus::Running => 1,
            AppStatus::Success => 2,
            AppStatus::Failed => 3,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, AppStatus::Starting | AppStatus::Running)
    }

    pub fn label(self) -> &'static str {
        match self {
            AppStatus::Starting => "Starting",
            AppStatus::Running => "Running",
            AppStatus::Success => "Success",
            AppStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl RunMode {
    pub fn label(self) -> &'static str {
        match self {
            RunMode::Once => "Once",
            RunMode::OnBoot => "On-boot",
        }
    }
}

/// One managed app, serialized verbatim as `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub mode: RunMode,
    pub status: AppStatus,
    pub command: String,
    /// `-1` until the supervisor has started.
    pub pid: i32,
    pub cwd: PathBuf,
    /// Environment snapshot as `KEY=VALUE` entries.
    pub env: Vec<String>,
    pub config_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl App {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Split the environment snapshot into key/value pairs.
    ///
    /// Entries without `=` become keys with an empty value.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env
            .iter()
            .map(|entry| entry.split_once('=').unwrap_or((entry.as_str(), "")))
    }

    /// Human-readable status, with the exit code once finished.
    pub fn status_line(&self) -> String {
        match (self.status, self.exit_code) {
            (AppStatus::Success | AppStatus::Failed, Some(code)) => {
                format!("{} ({code})", self.status)
            }
            (status, _) => status.to_string(),
        }
    }
}

/// Order apps by status priority, then by name.
pub fn sort_apps(apps: &mut [App]) {
    apps.sort_by(|a, b| {
        a.status
            .priority()
            .cmp(&b.status.priority())
            .then_with(|| a.name.cmp(&b.name))
    });
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-z0-9_-]+$").expect("static regex is valid"))
}

/// Check an app name against the naming rules.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.len() < NAME_MIN_LEN {
        return Err(format!(
            "name must be at least {NAME_MIN_LEN} characters long"
        ));
    }
    if name.len() > NAME_MAX_LEN {
        return Err(format!(
            "name must be at most {NAME_MAX_LEN} characters long"
        ));
    }
    if !name_pattern().is_match(name) {
        return Err("name must only contain lowercase, alphanumeric and -_".to_string());
    }
    Ok(())
}

pub fn validate_command(command: &str) -> Result<(), String> {
    if command.trim().is_empty() {
        return Err("command must not be empty".to_string());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_app(name: &str, status: AppStatus) -> App {
    let dir = PathBuf::from("/tmp/runapp-test").join(name);
    App {
        name: name.to_string(),
        mode: RunMode::Once,
        status,
        command: "echo hi".to_string(),
        pid: -1,
        cwd: PathBuf::from("/tmp"),
        env: vec!["PATH=/usr/bin:/bin".to_string()],
        stdout_path: dir.join("stdout.log"),
        stderr_path: dir.join("stderr.log"),
        config_path: dir,
        started_at: None,
        exit_code: None,
        finished_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&AppStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: AppStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, AppStatus::Failed);
    }

    #[test]
    fn test_mode_serializes_kebab() {
        assert_eq!(serde_json::to_string(&RunMode::OnBoot).unwrap(), "\"on-boot\"");
        assert_eq!(serde_json::to_string(&RunMode::Once).unwrap(), "\"once\"");
    }

    #[test]
    fn test_record_field_names() {
        let app = sample_app("web", AppStatus::Starting);
        let value = serde_json::to_value(&app).unwrap();
        let obj = value.as_object().unwrap();
        for key in [
            "name",
            "mode",
            "status",
            "command",
            "pid",
            "cwd",
            "env",
            "config_path",
            "stdout_path",
            "stderr_path",
            "started_at",
            "exit_code",
            "finished_at",
        ] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
        assert_eq!(obj.len(), 13);
        assert!(obj["exit_code"].is_null());
        assert_eq!(obj["pid"], -1);
    }

    #[test]
    fn test_is_active() {
        assert!(AppStatus::Starting.is_active());
        assert!(AppStatus::Running.is_active());
        assert!(!AppStatus::Success.is_active());
        assert!(!AppStatus::Failed.is_active());
    }

    #[test]
    fn test_sort_by_priority_then_name() {
        let mut apps = vec![
            sample_app("zeta", AppStatus::Failed),
            sample_app("beta", AppStatus::Success),
            sample_app("alpha", AppStatus::Failed),
            sample_app("omega", AppStatus::Running),
            sample_app("gamma", AppStatus::Starting),
            sample_app("delta", AppStatus::Running),
        ];
        sort_apps(&mut apps);
        let names: Vec<&str> = apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["gamma", "delta", "omega", "beta", "alpha", "zeta"]);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("my-app_2").is_ok());
        assert!(validate_name("ab").is_ok());
        assert!(validate_name(&"a".repeat(100)).is_ok());

        assert!(validate_name("a").unwrap_err().contains("at least 2"));
        assert!(validate_name(&"a".repeat(101)).unwrap_err().contains("at most 100"));
        assert!(validate_name("MyApp").is_err());
        assert!(validate_name("my app").is_err());
        assert!(validate_name("../etc").is_err());
    }

    #[test]
    fn test_validate_command() {
        assert!(validate_command("sleep 10").is_ok());
        assert!(validate_command("").is_err());
        assert!(validate_command("   ").is_err());
    }

    #[test]
    fn test_env_pairs() {
        let mut app = sample_app("web", AppStatus::Starting);
        app.env = vec![
            "A=1".to_string(),
            "B=x=y".to_string(),
            "NOVALUE".to_string(),
        ];
        let pairs: Vec<(&str, &str)> = app.env_pairs().collect();
        assert_eq!(pairs, vec![("A", "1"), ("B", "x=y"), ("NOVALUE", "")]);
    }

    #[test]
    fn test_status_line() {
        let mut app = sample_app("web", AppStatus::Failed);
        assert_eq!(app.status_line(), "Failed");
        app.exit_code = Some(137);
        assert_eq!(app.status_line(), "Failed (137)");
        app.status = AppStatus::Running;
        assert_eq!(app.status_line(), "Running");
    }
}
