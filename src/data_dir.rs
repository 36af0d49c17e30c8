use std::path::{Path, PathBuf};

/// File name of the per-app record.
pub const RECORD_FILE: &str = "config.json";
pub const STDOUT_FILE: &str = "stdout.log";
pub const STDERR_FILE: &str = "stderr.log";
/// Optional tuning file living next to the app directories.
pub const SETTINGS_FILE: &str = "settings.toml";

/// Manages the app root layout.
///
/// Every app owns one directory `<root>/<name>/` holding its record and its
/// two log files. The directory is the unit of existence: removing it removes
/// the app.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the settings file (e.g. `~/.config/runapp/settings.toml`).
    pub fn settings(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    /// The private directory of one app.
    pub fn app_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn record(&self, name: &str) -> PathBuf {
        self.app_dir(name).join(RECORD_FILE)
    }

    pub fn stdout_log(&self, name: &str) -> PathBuf {
        self.app_dir(name).join(STDOUT_FILE)
    }

    pub fn stderr_log(&self, name: &str) -> PathBuf {
        self.app_dir(name).join(STDERR_FILE)
    }

    /// Recreate an empty app directory with empty log files.
    ///
    /// Anything left over from a previous app of the same name is deleted.
    pub fn reset_app_dir(&self, name: &str) -> std::io::Result<PathBuf> {
        let dir = self.app_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::create_dir_all(&dir)?;
        std::fs::File::create(self.stdout_log(name))?;
        std::fs::File::create(self.stderr_log(name))?;
        Ok(dir)
    }

    /// Names of all app directories under the root. A missing root is empty.
    pub fn app_names(&self) -> std::io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // No app can have a non-UTF-8 name.
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_paths() {
        let dd = DataDir::new("/home/u/.config/runapp");
        assert_eq!(dd.root(), Path::new("/home/u/.config/runapp"));
        assert_eq!(
            dd.settings(),
            PathBuf::from("/home/u/.config/runapp/settings.toml")
        );
        assert_eq!(
            dd.app_dir("web"),
            PathBuf::from("/home/u/.config/runapp/web")
        );
        assert_eq!(
            dd.record("web"),
            PathBuf::from("/home/u/.config/runapp/web/config.json")
        );
        assert_eq!(
            dd.stdout_log("web"),
            PathBuf::from("/home/u/.config/runapp/web/stdout.log")
        );
        assert_eq!(
            dd.stderr_log("web"),
            PathBuf::from("/home/u/.config/runapp/web/stderr.log")
        );
    }

    #[test]
    fn test_reset_app_dir_creates_empty_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join("runapp"));

        let dir = dd.reset_app_dir("web").unwrap();
        assert!(dir.is_dir());
        assert_eq!(std::fs::read(dd.stdout_log("web")).unwrap().len(), 0);
        assert_eq!(std::fs::read(dd.stderr_log("web")).unwrap().len(), 0);
    }

    #[test]
    fn test_reset_app_dir_clears_previous_content() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path());

        dd.reset_app_dir("web").unwrap();
        std::fs::write(dd.stdout_log("web"), "old output").unwrap();
        std::fs::write(dd.app_dir("web").join("leftover"), "x").unwrap();

        dd.reset_app_dir("web").unwrap();
        assert_eq!(std::fs::read_to_string(dd.stdout_log("web")).unwrap(), "");
        assert!(!dd.app_dir("web").join("leftover").exists());
    }

    #[test]
    fn test_app_names_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join("does-not-exist"));
        assert!(dd.app_names().unwrap().is_empty());
    }

    #[test]
    fn test_app_names_skips_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path());
        dd.reset_app_dir("alpha").unwrap();
        dd.reset_app_dir("beta").unwrap();
        std::fs::write(dd.settings(), "").unwrap();

        let mut names = dd.app_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_app_names_skips_non_utf8_directories() {
        use std::os::unix::ffi::OsStrExt;

        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path());
        dd.reset_app_dir("web").unwrap();
        let odd = std::ffi::OsStr::from_bytes(b"bad\xffname");
        std::fs::create_dir(tmp.path().join(odd)).unwrap();

        assert_eq!(dd.app_names().unwrap(), vec!["web".to_string()]);
    }
}
