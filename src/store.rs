//! Record store: one JSON record per app directory.
//!
//! Uses atomic write pattern: write to a temp file in the app directory, then
//! rename, so readers never see a partial record. There is no locking; the
//! supervisor owning an app is the only writer of active states.

use crate::app::{sort_apps, App};
use crate::data_dir::DataDir;
use crate::probe::{ProcessProbe, SystemProbe};
use crate::reconcile::reconcile;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Clone)]
pub struct Store {
    dir: DataDir,
    probe: Arc<dyn ProcessProbe>,
    max_parallel: usize,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.dir)
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

impl Store {
    pub fn new(dir: DataDir, max_parallel: usize) -> Self {
        Self::with_probe(dir, max_parallel, Arc::new(SystemProbe))
    }

    pub fn with_probe(dir: DataDir, max_parallel: usize, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            dir,
            probe,
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.dir
    }

    /// Atomically overwrite the record of `app`.
    ///
    /// The app directory must already exist; a record is never written for a
    /// directory that was removed in the meantime.
    pub fn save(&self, app: &App) -> Result<(), StoreError> {
        let path = self.dir.record(&app.name);
        let json =
            serde_json::to_vec_pretty(app).map_err(|e| StoreError::Serialize { source: e })?;

        let app_dir = self.dir.app_dir(&app.name);
        let mut tmp = tempfile::Builder::new()
            .prefix(".config.json.tmp.")
            .tempfile_in(&app_dir)
            .map_err(|e| StoreError::Io {
                path: app_dir.clone(),
                source: e,
            })?;
        tmp.write_all(&json).map_err(|e| StoreError::Io {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;
        tmp.persist(&path).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Read a record without reconciling it.
    pub fn read(&self, name: &str) -> Result<App, StoreError> {
        read_record(&self.dir.record(name))
    }

    /// Read and reconcile a record.
    pub fn get(&self, name: &str) -> Result<App, StoreError> {
        let app = self.read(name)?;
        Ok(self.reconciled(app))
    }

    /// Apply reconciliation and persist any correction best-effort.
    fn reconciled(&self, mut app: App) -> App {
        if reconcile(&mut app, self.probe.as_ref()) {
            if let Err(e) = self.save(&app) {
                tracing::warn!(
                    name = %app.name,
                    error = %e,
                    "failed to persist reconciled status"
                );
            }
        }
        app
    }

    /// Read, reconcile and sort every app.
    ///
    /// Records are read concurrently, at most `max_parallel` at a time. The
    /// first failing read fails the whole listing.
    pub async fn list(&self) -> Result<Vec<App>, StoreError> {
        let names = self.dir.app_names().map_err(|e| StoreError::Io {
            path: self.dir.root().to_path_buf(),
            source: e,
        })?;

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();
        for name in names {
            let store = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                tokio::task::spawn_blocking(move || store.get(&name))
                    .await
                    .map_err(|e| StoreError::Task { source: e })?
            });
        }

        let mut apps = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| StoreError::Task { source: e })?;
            match result {
                Ok(app) => apps.push(app),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        sort_apps(&mut apps);
        Ok(apps)
    }

    /// True when at least one app directory exists. A missing root is false.
    pub fn has_any(&self) -> Result<bool, StoreError> {
        self.dir
            .app_names()
            .map(|names| !names.is_empty())
            .map_err(|e| StoreError::Io {
                path: self.dir.root().to_path_buf(),
                source: e,
            })
    }

    /// Delete the app directory, and with it the app.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let dir = self.dir.app_dir(name);
        std::fs::remove_dir_all(&dir).map_err(|e| StoreError::Io {
            path: dir,
            source: e,
        })
    }
}

fn read_record(path: &Path) -> Result<App, StoreError> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound),
        Err(e) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    serde_json::from_slice(&contents).map_err(|e| StoreError::Deserialize {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors from record store operations.
#[derive(Debug)]
pub enum StoreError {
    NotFound,
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Deserialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    Task {
        source: tokio::task::JoinError,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "app does not exist"),
            StoreError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            StoreError::Serialize { source } => write!(f, "failed to serialize record: {source}"),
            StoreError::Deserialize { path, source } => {
                write!(f, "corrupt record {}: {source}", path.display())
            }
            StoreError::Task { source } => write!(f, "record read task failed: {source}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::NotFound => None,
            StoreError::Io { source, .. } => Some(source),
            StoreError::Serialize { source } => Some(source),
            StoreError::Deserialize { source, .. } => Some(source),
            StoreError::Task { source } => Some(source),
        }
    }
}
