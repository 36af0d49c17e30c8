use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that enables verbose diagnostics.
pub const DEBUG_ENV: &str = "DEBUG";

/// Environment variable overriding the app root directory.
pub const HOME_ENV: &str = "RUNAPP_HOME";

/// Optional tuning loaded from `<root>/settings.toml`.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Settings {
    pub kill: KillConfig,
    pub list: ListConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KillConfig {
    /// How long the soft kill polls for the tree to exit after SIGTERM.
    pub grace_timeout_ms: u64,
    /// Outer timer raced against the soft kill by the `kill` command.
    pub command_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Bound on waiting for the supervisor to vanish after escalation.
    pub finalize_wait_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListConfig {
    pub max_parallel: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub poll_interval_ms: u64,
    pub status_interval_ms: u64,
    pub max_line_bytes: usize,
}

impl Default for KillConfig {
    fn default() -> Self {
        Self {
            grace_timeout_ms: 10_000,
            command_timeout_ms: 10_000,
            poll_interval_ms: 50,
            finalize_wait_ms: 2000,
        }
    }
}

impl Default for ListConfig {
    fn default() -> Self {
        Self { max_parallel: 16 }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            status_interval_ms: 500,
            max_line_bytes: 10 * 1024 * 1024,
        }
    }
}

impl KillConfig {
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn finalize_wait(&self) -> Duration {
        Duration::from_millis(self.finalize_wait_ms)
    }
}

impl LogsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

impl Settings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Values read once from the process environment.
#[derive(Debug, Clone)]
pub struct Environment {
    pub debug: bool,
    pub root: PathBuf,
}

impl Environment {
    pub fn from_env() -> Result<Self, ConfigError> {
        let debug = is_debug(std::env::var(DEBUG_ENV).ok().as_deref());
        let root = resolve_root(
            std::env::var_os(HOME_ENV).map(PathBuf::from),
            std::env::var_os("HOME").map(PathBuf::from),
        )?;
        Ok(Self { debug, root })
    }
}

/// `DEBUG=true` in any letter case turns debugging on; anything else is off.
pub fn is_debug(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Pick the app root: explicit override first, then `$HOME/.config/runapp`.
pub fn resolve_root(
    override_dir: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return Ok(dir);
    }
    match home.filter(|h| !h.as_os_str().is_empty()) {
        Some(home) => Ok(home.join(".config").join("runapp")),
        None => Err(ConfigError::NoHome),
    }
}

/// Errors from loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    NoHome,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read settings {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid settings {}: {source}", path.display())
            }
            ConfigError::NoHome => write!(
                f,
                "cannot locate the home directory, set HOME or {HOME_ENV}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::NoHome => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.kill.grace_timeout(), Duration::from_secs(10));
        assert_eq!(settings.kill.command_timeout(), Duration::from_secs(10));
        assert_eq!(settings.kill.poll_interval(), Duration::from_millis(50));
        assert_eq!(settings.list.max_parallel, 16);
        assert_eq!(settings.logs.status_interval(), Duration::from_millis(500));
        assert_eq!(settings.logs.max_line_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings.kill.grace_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_partial_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[kill]\ngrace_timeout_ms = 3000\n\n[list]\nmax_parallel = 2\n")
            .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.kill.grace_timeout_ms, 3000);
        assert_eq!(settings.kill.command_timeout_ms, 10_000);
        assert_eq!(settings.list.max_parallel, 2);
        assert_eq!(settings.logs.poll_interval_ms, 200);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[kill\n").unwrap();

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("invalid settings"));
    }

    #[test]
    fn test_is_debug() {
        assert!(!is_debug(None));
        assert!(is_debug(Some("true")));
        assert!(is_debug(Some("TrUe")));
        assert!(!is_debug(Some("false")));
        assert!(!is_debug(Some("1")));
    }

    #[test]
    fn test_resolve_root_prefers_override() {
        let root = resolve_root(
            Some(PathBuf::from("/tmp/apps")),
            Some(PathBuf::from("/home/u")),
        )
        .unwrap();
        assert_eq!(root, PathBuf::from("/tmp/apps"));
    }

    #[test]
    fn test_resolve_root_from_home() {
        let root = resolve_root(None, Some(PathBuf::from("/home/u"))).unwrap();
        assert_eq!(root, PathBuf::from("/home/u/.config/runapp"));
    }

    #[test]
    fn test_resolve_root_without_home() {
        let err = resolve_root(Some(PathBuf::new()), None).unwrap_err();
        assert!(matches!(err, ConfigError::NoHome));
    }
}
