//! Per-invocation context: the store, its resolved configuration and the
//! durable log, opened together and synced at the boundaries.

use eyre::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE, Config};
use crate::store::{Store, TRAK_FLOW_DIR};
use crate::sync::{ExportReport, ImportReport, LOG_HASH_KEY, SyncLog};

/// An open `.trak_flow` project.
///
/// The cache connection lives as long as the session and is released when
/// it drops, whether or not the work in between succeeded.
pub struct Session {
    dir: PathBuf,
    config: Config,
    store: Store,
    log: SyncLog,
}

impl Session {
    /// Create `.trak_flow/` under `root` with a cache, a default config and
    /// an empty log. An existing log is imported instead of overwritten.
    pub fn init(root: &Path) -> Result<Self> {
        let store = Store::init(root)?;
        let dir = root.join(TRAK_FLOW_DIR);

        if !dir.join(CONFIG_FILE).exists() {
            Config::default().save(&dir)?;
        }
        let config = Config::load(&dir)?;
        let log = SyncLog::in_dir(&dir);
        let store = store.with_id_config(config.id.clone());

        let mut session = Self { dir, config, store, log };
        if session.log.exists() {
            session.import()?;
        } else {
            session.export()?;
        }
        log::info!("Initialized TrakFlow in {}", session.dir.display());
        Ok(session)
    }

    /// Open an initialized project, re-importing the log if it changed since
    /// the last import or export.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Store::open(root)?;
        let dir = root.join(TRAK_FLOW_DIR);
        let config = Config::load(&dir)?;
        let log = SyncLog::in_dir(&dir);
        let store = store.with_id_config(config.id.clone());

        let mut session = Self { dir, config, store, log };
        if session.log_changed()? {
            session.import()?;
        }
        Ok(session)
    }

    /// Open, run `f`, and export if `f` left the store dirty.
    pub fn run<T>(root: &Path, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut session = Self::open(root)?;
        let value = f(&mut session)?;
        session.flush()?;
        Ok(value)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn log(&self) -> &SyncLog {
        &self.log
    }

    /// Whether the log content differs from what was last synced.
    pub fn log_changed(&self) -> Result<bool> {
        let Some(current) = self.log.content_hash()? else {
            return Ok(false);
        };
        let recorded = self.store.meta(LOG_HASH_KEY)?;
        Ok(recorded.as_deref() != Some(current.as_str()))
    }

    pub fn import(&mut self) -> Result<ImportReport> {
        self.log
            .import(&mut self.store, &self.config.import)
            .context("Failed to import log")
    }

    pub fn export(&mut self) -> Result<ExportReport> {
        self.log
            .export(&mut self.store, self.config.export.error_policy)
            .context("Failed to export log")
    }

    /// Export only the records for `changed_ids`.
    pub fn export_changed(&mut self, changed_ids: &[String]) -> Result<ExportReport> {
        self.log
            .incremental_export(&mut self.store, changed_ids, self.config.export.error_policy)
            .context("Failed to export log")
    }

    /// Drop the cache contents and rebuild them from the log.
    pub fn reimport(&mut self) -> Result<ImportReport> {
        self.store.clear()?;
        self.import()
    }

    /// Export when the store has unexported changes.
    pub fn flush(&mut self) -> Result<Option<ExportReport>> {
        if !self.store.is_dirty() {
            return Ok(None);
        }
        self.export().map(Some)
    }
}

/// Walk up from `start` to the nearest directory containing `.trak_flow`.
pub fn find_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(TRAK_FLOW_DIR).is_dir())
        .map(Path::to_path_buf)
}
