//! Database (C5): the public facade composing the handle pool, config
//! registry, migration engine, and repair engine around one database path
//! (§4.5).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::info;
use tokio::runtime::Runtime;

use crate::config::{Priority, BASIC_CONFIG_NAME};
use crate::error::{Error, Result};
use crate::handle::HandleCategory;
use crate::migration::{MigrationEngine, MigratedNotifier, StepOutcome};
use crate::observability::{self, CorruptionNotifier, ErrorTracer, Observability, OperationTracer, PerformanceTracer, SqlTracer};
use crate::pool::{HandlePool, Recyclable};
use crate::repair;

/// `Database::open`'s configuration, mirroring the existing `Config`-struct
/// shape (§1.1): an explicit, `Default`-able struct passed to a constructor
/// rather than a builder or env-scraping crate.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub max_handles: usize,
    pub busy_timeout: Duration,
    pub cipher_page_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data.db"),
            max_handles: 4,
            busy_timeout: Duration::from_secs(5),
            cipher_page_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn pragma_arg(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

fn shared_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("stratum-bg")
            .enable_time()
            .build()
            .expect("failed to start background runtime")
    })
}

/// Facade composing `HandlePool`, `ConfigRegistry`, `MigrationEngine`, and
/// the repair helpers around one database path.
pub struct Database {
    path: String,
    pool: HandlePool,
    migration: Arc<MigrationEngine>,
    tag: Mutex<Option<i64>>,
    busy_timeout: Duration,
}

impl Database {
    pub fn open(config: Config) -> Result<Self> {
        let path = config
            .path
            .to_str()
            .ok_or_else(|| Error::misuse("database path is not valid UTF-8"))?
            .to_string();

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(Error::from)?;
            }
        }

        let pool = HandlePool::new(&path, config.max_handles);
        let busy_timeout = config.busy_timeout;
        pool.with_registry(|registry| {
            registry.set(
                BASIC_CONFIG_NAME,
                Priority::DEFAULT,
                Arc::new(move |handle| {
                    handle.exec_direct("PRAGMA journal_mode = WAL")?;
                    handle.exec_direct("PRAGMA foreign_keys = ON")?;
                    handle.raw().set_busy_timeout_ms(0);
                    Ok(())
                }),
                None,
            );
        });

        info!("database opened: path={path} max_handles={}", config.max_handles);
        Ok(Self {
            path,
            pool,
            migration: Arc::new(MigrationEngine::new()),
            tag: Mutex::new(None),
            busy_timeout,
        })
    }

    pub fn can_open(path: &str) -> bool {
        Path::new(path)
            .parent()
            .map(|p| p.as_os_str().is_empty() || p.exists())
            .unwrap_or(true)
    }

    pub fn is_opened(&self) -> bool {
        self.pool.number_of_alive_handles() > 0
    }

    pub fn get_path(&self) -> &str {
        &self.path
    }

    pub fn set_tag(&self, tag: i64) {
        *self.tag.lock().unwrap() = Some(tag);
    }

    pub fn tag(&self) -> Option<i64> {
        *self.tag.lock().unwrap()
    }

    pub fn blockade(&self) {
        self.pool.blockade();
    }

    pub fn unblockade(&self) {
        self.pool.unblockade();
    }

    pub fn purge(&self) {
        self.pool.purge();
    }

    /// Blocks new checkouts, waits for outstanding handles to drain (best
    /// effort: this implementation purges idle handles and blockades new
    /// ones rather than blocking the caller's thread), runs `after`, then
    /// lifts the blockade so the same `Database` can be reopened by a later
    /// `get_handle` rather than being parked forever (the blockade count is
    /// refcounted by `HandlePool`, so this exactly undoes the `blockade()`
    /// above).
    pub fn close(&self, after: impl FnOnce()) {
        self.pool.blockade();
        self.pool.purge();
        after();
        self.pool.unblockade();
    }

    /// Requires the database be closed (no alive handles) and `dest` empty;
    /// otherwise fails with `Misuse` (§4.5).
    pub fn move_files(&self, dest: &str) -> Result<()> {
        if self.pool.number_of_alive_handles() > 0 {
            return Err(Error::misuse("cannot move files while the database has live handles"));
        }
        let dest_path = Path::new(dest);
        if dest_path.exists() && dest_path.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) {
            return Err(Error::misuse("destination directory is not empty"));
        }
        std::fs::create_dir_all(dest_path).map_err(Error::from)?;
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let src = PathBuf::from(format!("{}{suffix}", self.path));
            if src.exists() {
                let name = src.file_name().unwrap();
                std::fs::rename(&src, dest_path.join(name)).map_err(Error::from)?;
            }
        }
        Ok(())
    }

    pub fn remove_files(&self) -> Result<()> {
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let p = PathBuf::from(format!("{}{suffix}", self.path));
            if p.exists() {
                std::fs::remove_file(p).map_err(Error::from)?;
            }
        }
        Ok(())
    }

    /// Registers a cipher config at `Highest` priority so it sits outermost
    /// (§4.2). `PRAGMA key` is set first, then a read against `sqlite_master`
    /// forces SQLCipher to validate the key immediately rather than lazily
    /// on the first caller query: a wrong key makes that read fail with
    /// `NotADatabase` (§8 S1), and `from_engine_code` classifies it as such.
    pub fn config_cipher(&self, key: &[u8], page_size: u32, version: u32) -> Result<()> {
        let key_hex: String = key.iter().map(|b| format!("{b:02x}")).collect();
        self.pool.with_registry(|registry| {
            registry.set(
                "cipher",
                Priority::HIGHEST,
                Arc::new(move |handle| {
                    handle.exec_direct(&format!("PRAGMA key = \"x'{key_hex}'\""))?;
                    handle.exec_direct(&format!("PRAGMA cipher_page_size = {page_size}"))?;
                    handle.exec_direct(&format!("PRAGMA kdf_iter = {version}"))?;
                    handle.exec_direct("SELECT count(*) FROM sqlite_master")?;
                    Ok(())
                }),
                None,
            );
        });
        Ok(())
    }

    pub fn set_config(
        &self,
        name: &str,
        priority: Priority,
        invoke: crate::config::InvokeFn,
        uninvoke: Option<crate::config::UninvokeFn>,
    ) {
        self.pool.with_registry(|registry| registry.set(name, priority, invoke, uninvoke));
    }

    pub fn remove_config(&self, name: &str) -> bool {
        self.pool.with_registry(|registry| registry.remove(name))
    }

    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        let mut handle = self.pool.checkout(HandleCategory::Checkpoint, true)?;
        handle.exec_direct(&format!("PRAGMA wal_checkpoint({})", mode.pragma_arg()))
    }

    pub fn get_handle(&self, write_hint: bool) -> Result<Recyclable> {
        self.pool.checkout(HandleCategory::Normal, write_hint)
    }

    // --- migration (C6) ---

    pub fn add_migration(&self, target_table: &str, source_path: Option<String>, source_table: &str, filter: Option<String>) {
        self.migration.add_migration(target_table, source_path, source_table, filter);
    }

    pub fn step_migration(&self, force: bool) -> Result<StepOutcome> {
        let mut handle = self.pool.checkout(HandleCategory::Migrate, true)?;
        self.migration.step_migration(&mut handle, force)
    }

    pub fn is_migrated(&self, target_table: &str) -> bool {
        self.migration.is_migrated(target_table)
    }

    pub fn set_notification_when_migrated(&self, notifier: MigratedNotifier) {
        self.migration.set_notification_when_migrated(notifier);
    }

    /// Registers (or removes) auto-migration as a named `Config` (§1.2)
    /// instead of driving the background loop directly: `invoke` starts it
    /// on the per-path refcount's 0→1 edge, `uninvoke` stops it on 1→0,
    /// composing with the ordinary reconfiguration protocol (§4.2) rather
    /// than needing bespoke lifecycle code here.
    pub fn enable_auto_migration(&self, enabled: bool) {
        if !enabled {
            self.pool.with_registry(|registry| registry.remove(crate::migration::AUTO_MIGRATE_CONFIG_NAME));
            return;
        }
        let invoke_migration = self.migration.clone();
        let pool = self.pool.clone();
        let runtime = shared_runtime().handle().clone();
        let uninvoke_migration = self.migration.clone();
        self.pool.with_registry(|registry| {
            registry.set(
                crate::migration::AUTO_MIGRATE_CONFIG_NAME,
                Priority::DEFAULT,
                Arc::new(move |_handle| {
                    invoke_migration.auto_invoke(pool.clone(), runtime.clone());
                    Ok(())
                }),
                Some(Arc::new(move |_handle| {
                    uninvoke_migration.auto_uninvoke();
                    Ok(())
                })),
            );
        });
    }

    // --- repair (C7) ---

    pub fn backup(&self, filter: impl Fn(&str) -> bool) -> Result<()> {
        let mut handle = self.pool.checkout(HandleCategory::BackupWrite, false)?;
        repair::backup(&mut handle, filter)
    }

    pub fn deposit(&self) -> Result<PathBuf> {
        self.pool.purge();
        repair::deposit(&self.path, repair::now_unix_secs())
    }

    pub fn contains_deposited_files(&self) -> bool {
        repair::contains_deposited_files(&self.path)
    }

    pub fn remove_deposited_files(&self) -> Result<()> {
        repair::remove_deposited_files(&self.path)
    }

    pub fn retrieve(&self, progress: impl FnMut(f64, f64)) -> Result<f64> {
        let mut handle = self.pool.checkout(HandleCategory::Assemble, true)?;
        repair::retrieve(&mut handle, &self.path, progress)
    }

    pub fn check_integrity(&self) -> Result<bool> {
        let mut handle = self.pool.checkout(HandleCategory::Integrity, false)?;
        handle.prepare_main("PRAGMA integrity_check")?;
        handle.step_main()?;
        let row = handle.row_main().unwrap_or_default();
        handle.finalize_main();
        let ok = row.first().and_then(|v| v.as_text().map(|s| s == "ok")).unwrap_or(false);
        if ok {
            observability::global().clear_corrupted(&self.path);
        } else {
            observability::global().notify_corrupted(&self.path);
        }
        Ok(ok)
    }

    // --- observability (C8) passthroughs ---

    pub fn trace_sql(&self, tracer: SqlTracer) {
        observability::global().set_sql_tracer(&self.path, tracer);
    }

    pub fn trace_performance(&self, tracer: PerformanceTracer) {
        observability::global().set_performance_tracer(&self.path, tracer);
    }

    pub fn trace_error(&self, tracer: ErrorTracer) {
        observability::global().set_error_tracer(&self.path, tracer);
    }

    pub fn trace_operation(&self, tracer: OperationTracer) {
        observability::global().set_operation_tracer(&self.path, tracer);
    }

    pub fn set_notification_when_corrupted(&self, notifier: CorruptionNotifier) {
        observability::global().set_notification_when_corrupted(&self.path, notifier);
    }

    pub fn set_full_sql_trace_enable(&self, enabled: bool) {
        observability::global().set_full_sql_trace_enable(enabled);
    }

    pub fn observability(&self) -> &'static Observability {
        observability::global()
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let db = Database::open(Config { path, ..Config::default() }).unwrap();
        (dir, db)
    }

    #[test]
    fn open_creates_handle_on_demand() {
        let (_dir, db) = open_tmp();
        assert!(!db.is_opened());
        {
            let mut h = db.get_handle(true).unwrap();
            h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
        }
        assert!(db.is_opened());
        db.purge();
        assert!(!db.is_opened());
    }

    #[test]
    fn move_files_requires_no_live_handles() {
        let (dir, db) = open_tmp();
        let _h = db.get_handle(true).unwrap();
        let dest = dir.path().join("moved");
        let err = db.move_files(dest.to_str().unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn check_integrity_reports_ok_on_healthy_database() {
        let (_dir, db) = open_tmp();
        {
            let mut h = db.get_handle(true).unwrap();
            h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
        }
        assert!(db.check_integrity().unwrap());
    }

    #[test]
    fn wrong_cipher_key_on_reopen_is_not_a_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.db");
        {
            let db = Database::open(Config { path: path.clone(), ..Config::default() }).unwrap();
            db.config_cipher(b"correct horse battery staple", 4096, 4).unwrap();
            let mut h = db.get_handle(true).unwrap();
            h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
            h.execute("INSERT INTO t(id, v) VALUES (1, 'a')").unwrap();
            db.close(|| {});
        }

        let db = Database::open(Config { path, max_handles: 1, ..Config::default() }).unwrap();
        db.config_cipher(b"wrong key entirely", 4096, 4).unwrap();
        let err = db.get_handle(true).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotADatabase);
    }

    #[test]
    fn close_lifts_its_own_blockade_so_the_same_database_can_reopen() {
        let (_dir, db) = open_tmp();
        {
            let mut h = db.get_handle(true).unwrap();
            h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
        }
        db.close(|| {});

        // Blockade is refcounted (§4.2-adjacent pool internals); close()
        // must undo its own blockade() or every later checkout blocks the
        // full 5s deadline and then fails Busy forever.
        let mut h = db.get_handle(true).unwrap();
        h.execute("INSERT INTO t(id) VALUES (1)").unwrap();
    }
}
