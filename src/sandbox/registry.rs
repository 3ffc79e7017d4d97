//! Persistent sandbox ownership registry.
//!
//! SQLite with WAL mode. `user_id` and `public_id` carry UNIQUE constraints,
//! so two concurrent first requests for the same owner cannot both insert:
//! the loser sees a constraint violation and adopts the winner's record.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::identity::{hash_id, CanonicalId};
use super::address::AccessRecorder;
use super::store::KvStore;
use super::{CallerContext, Isolation};
use crate::runtime::SandboxDriver;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("registry lock poisoned: {0}")]
    Poisoned(String),

    #[error("caller has no user id, public id or session sandbox")]
    NoIdentity,

    #[error("could not allocate a sandbox id after {attempts} attempts")]
    Exhausted { attempts: usize },
}

/// A persisted ownership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxRecord {
    pub sandbox_id: String,
    pub user_id: Option<i64>,
    pub public_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once a runtime unit has been provisioned for the record.
    pub provisioned_at: Option<DateTime<Utc>>,
}

impl SandboxRecord {
    /// Whether the record ties the sandbox to the caller's identity.
    pub fn is_owned_by(&self, caller: &CallerContext) -> bool {
        let by_user = matches!((self.user_id, caller.user_id), (Some(a), Some(b)) if a == b);
        let by_public = matches!(
            (&self.public_id, &caller.public_id),
            (Some(a), Some(b)) if a == b
        );
        by_user || by_public
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownStep {
    Container,
    Cache,
    Database,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: TeardownStep,
    pub error: String,
}

/// Outcome of a complete teardown. Every step is always attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub sandbox_id: String,
    pub deleted: Vec<TeardownStep>,
    pub already_gone: Vec<TeardownStep>,
    pub errors: Vec<StepFailure>,
    pub success: bool,
}

enum StepOutcome {
    Deleted,
    Absent,
}

/// Tuning knobs for id allocation and storage.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub id_length: usize,
    pub max_attempts: usize,
    /// Parent of the per-sandbox storage directories.
    pub storage_root: Option<PathBuf>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            id_length: 12,
            max_attempts: 16,
            storage_root: None,
        }
    }
}

pub struct SandboxRegistry {
    conn: Mutex<Connection>,
    driver: Arc<SandboxDriver>,
    recorder: AccessRecorder,
    options: RegistryOptions,
}

impl std::fmt::Debug for SandboxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRegistry")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SandboxRegistry {
    /// Open (or create) the registry. Pass `":memory:"` for testing.
    pub fn open(
        path: &str,
        driver: Arc<SandboxDriver>,
        store: Arc<dyn KvStore>,
        options: RegistryOptions,
    ) -> Result<Self, RegistryError> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    warn!("Could not create registry directory {:?}: {}", parent, e);
                }
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sandboxes (
                sandbox_id     TEXT PRIMARY KEY,
                user_id        INTEGER UNIQUE,
                public_id      TEXT UNIQUE,
                created_at     TEXT NOT NULL,
                provisioned_at TEXT
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            driver,
            recorder: AccessRecorder::new(store),
            options,
        })
    }

    /// Evict cache entries through `recorder` (normally the address
    /// resolver's) so teardown is ordered after recorded accesses.
    pub fn with_recorder(mut self, recorder: AccessRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn
            .lock()
            .map_err(|e| RegistryError::Poisoned(e.to_string()))
    }

    /// Find the caller's sandbox or create one.
    ///
    /// Administrators get [`Isolation::Unconstrained`] unless they force
    /// sandbox mode. Stale records (provisioned, but the unit is gone) are
    /// pruned and replaced.
    pub fn find_or_create(&self, caller: &CallerContext) -> Result<Isolation, RegistryError> {
        if caller.is_unconstrained() {
            return Ok(Isolation::Unconstrained);
        }
        if !caller.has_identity() {
            if let Some(id) = caller.session_sandbox.as_deref().and_then(CanonicalId::parse) {
                if self.validate(&id) {
                    return Ok(Isolation::Sandboxed(id));
                }
            }
            return Err(RegistryError::NoIdentity);
        }

        if let Some(id) = self.find_live(caller)? {
            return Ok(Isolation::Sandboxed(id));
        }
        self.create_for(caller).map(Isolation::Sandboxed)
    }

    /// Most recent live record for the caller, pruning stale ones on the way.
    fn find_live(&self, caller: &CallerContext) -> Result<Option<CanonicalId>, RegistryError> {
        for record in self.records_for(caller)? {
            let Some(id) = CanonicalId::parse(&record.sandbox_id) else {
                warn!("Pruning record with non-canonical id {:?}", record.sandbox_id);
                self.delete_row(&record.sandbox_id)?;
                continue;
            };
            if self.unit_alive(&record) {
                debug!("Reusing sandbox {} for caller", id);
                return Ok(Some(id));
            }
            info!("Pruning stale sandbox record {}", id);
            self.delete_row(id.as_str())?;
        }
        Ok(None)
    }

    fn records_for(&self, caller: &CallerContext) -> Result<Vec<SandboxRecord>, RegistryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sandbox_id, user_id, public_id, created_at, provisioned_at
             FROM sandboxes
             WHERE (?1 IS NOT NULL AND user_id = ?1) OR (?2 IS NOT NULL AND public_id = ?2)
             ORDER BY rowid DESC",
        )?;
        let rows = stmt.query_map(params![caller.user_id, caller.public_id], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// A never-provisioned record is pending, not stale. When the runtime
    /// cannot answer, liveness is not determinable and the row decides.
    fn unit_alive(&self, record: &SandboxRecord) -> bool {
        if record.provisioned_at.is_none() {
            return true;
        }
        let id = CanonicalId::new(&record.sandbox_id);
        match self.driver.exists(&id) {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Could not check unit for {}: {}", id, e);
                true
            }
        }
    }

    fn create_for(&self, caller: &CallerContext) -> Result<CanonicalId, RegistryError> {
        for attempt in 0..self.options.max_attempts {
            let id = CanonicalId::new(&random_id(self.options.id_length));
            match self.insert(&id, caller) {
                Ok(()) => return Ok(self.finish_create(id, caller)),
                Err(e) => match constraint_column(&e) {
                    Some("sandbox_id") => {
                        debug!("Sandbox id collision on attempt {}", attempt + 1);
                        continue;
                    }
                    Some("user_id") | Some("public_id") => return self.adopt_winner(caller),
                    _ => return Err(e),
                },
            }
        }

        let fallback = CanonicalId::new(&hash_id(&owner_key(caller)));
        warn!(
            "Random id allocation exhausted, using hash-derived id {}",
            fallback
        );
        match self.insert(&fallback, caller) {
            Ok(()) => Ok(self.finish_create(fallback, caller)),
            Err(e) => match constraint_column(&e) {
                Some("user_id") | Some("public_id") => self.adopt_winner(caller),
                Some(_) => Err(RegistryError::Exhausted {
                    attempts: self.options.max_attempts + 1,
                }),
                None => Err(e),
            },
        }
    }

    /// Another request created the owner's record first; use theirs.
    fn adopt_winner(&self, caller: &CallerContext) -> Result<CanonicalId, RegistryError> {
        info!("Concurrent sandbox creation detected, adopting existing record");
        self.records_for(caller)?
            .into_iter()
            .find_map(|r| CanonicalId::parse(&r.sandbox_id))
            .ok_or(RegistryError::Exhausted {
                attempts: self.options.max_attempts,
            })
    }

    fn insert(&self, id: &CanonicalId, caller: &CallerContext) -> Result<(), RegistryError> {
        self.conn()?.execute(
            "INSERT INTO sandboxes (sandbox_id, user_id, public_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id.as_str(),
                caller.user_id,
                caller.public_id,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn finish_create(&self, id: CanonicalId, caller: &CallerContext) -> CanonicalId {
        info!(
            "Created sandbox {} for user {:?} / public id {:?}",
            id, caller.user_id, caller.public_id
        );
        if let Some(dir) = self.storage_dir(&id) {
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!("Could not create storage directory {:?}: {}", dir, e);
            }
        }
        id
    }

    fn storage_dir(&self, id: &CanonicalId) -> Option<PathBuf> {
        self.options
            .storage_root
            .as_ref()
            .map(|root| root.join(id.as_str()))
    }

    /// Record that a runtime unit now exists for `id`.
    pub fn mark_provisioned(&self, id: &CanonicalId) -> Result<(), RegistryError> {
        self.conn()?.execute(
            "UPDATE sandboxes SET provisioned_at = ?2 WHERE sandbox_id = ?1",
            params![id.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn record(&self, id: &CanonicalId) -> Result<Option<SandboxRecord>, RegistryError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT sandbox_id, user_id, public_id, created_at, provisioned_at
                 FROM sandboxes WHERE sandbox_id = ?1",
                params![id.as_str()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// True only if a row exists and, when determinable, the unit exists.
    /// Any data-store error counts as invalid.
    pub fn validate(&self, id: &CanonicalId) -> bool {
        match self.record(id) {
            Ok(Some(record)) => self.unit_alive(&record),
            Ok(None) => false,
            Err(e) => {
                warn!("Validation of {} failed closed: {}", id, e);
                false
            }
        }
    }

    fn delete_row(&self, id: &str) -> Result<bool, RegistryError> {
        let n = self
            .conn()?
            .execute("DELETE FROM sandboxes WHERE sandbox_id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Remove every trace of a sandbox. Steps run independently; running it
    /// again reports each step as already gone.
    pub fn teardown(&self, id: &CanonicalId) -> TeardownReport {
        let steps: [(TeardownStep, Result<StepOutcome, String>); 4] = [
            (TeardownStep::Container, self.teardown_container(id)),
            (TeardownStep::Cache, self.teardown_cache(id)),
            (TeardownStep::Database, self.teardown_row(id)),
            (TeardownStep::Directory, self.teardown_directory(id)),
        ];

        let mut report = TeardownReport {
            sandbox_id: id.to_string(),
            deleted: Vec::new(),
            already_gone: Vec::new(),
            errors: Vec::new(),
            success: true,
        };
        for (step, outcome) in steps {
            match outcome {
                Ok(StepOutcome::Deleted) => report.deleted.push(step),
                Ok(StepOutcome::Absent) => report.already_gone.push(step),
                Err(error) => {
                    warn!("Teardown of {} failed at {:?}: {}", id, step, error);
                    report.errors.push(StepFailure { step, error });
                }
            }
        }
        report.success = report.errors.is_empty();
        info!(
            "Teardown of {}: deleted {:?}, already gone {:?}, {} error(s)",
            id,
            report.deleted,
            report.already_gone,
            report.errors.len()
        );
        report
    }

    fn teardown_container(&self, id: &CanonicalId) -> Result<StepOutcome, String> {
        match self.driver.delete(id) {
            Ok(true) => Ok(StepOutcome::Deleted),
            Ok(false) => Ok(StepOutcome::Absent),
            Err(e) => Err(e.to_string()),
        }
    }

    fn teardown_cache(&self, id: &CanonicalId) -> Result<StepOutcome, String> {
        Ok(if self.recorder.evict(id)? {
            StepOutcome::Deleted
        } else {
            StepOutcome::Absent
        })
    }

    fn teardown_row(&self, id: &CanonicalId) -> Result<StepOutcome, String> {
        match self.delete_row(id.as_str()) {
            Ok(true) => Ok(StepOutcome::Deleted),
            Ok(false) => Ok(StepOutcome::Absent),
            Err(e) => Err(e.to_string()),
        }
    }

    fn teardown_directory(&self, id: &CanonicalId) -> Result<StepOutcome, String> {
        let Some(dir) = self.storage_dir(id) else {
            return Ok(StepOutcome::Absent);
        };
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(StepOutcome::Deleted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StepOutcome::Absent),
            Err(e) => Err(format!("{}: {}", dir.display(), e)),
        }
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SandboxRecord> {
    let created: String = row.get(3)?;
    let provisioned: Option<String> = row.get(4)?;
    Ok(SandboxRecord {
        sandbox_id: row.get(0)?,
        user_id: row.get(1)?,
        public_id: row.get(2)?,
        created_at: parse_time(&created).unwrap_or_else(Utc::now),
        provisioned_at: provisioned.as_deref().and_then(parse_time),
    })
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Column named by a UNIQUE violation, e.g. `user_id` for
/// "UNIQUE constraint failed: sandboxes.user_id".
fn constraint_column(err: &RegistryError) -> Option<&str> {
    match err {
        RegistryError::Db(rusqlite::Error::SqliteFailure(e, Some(msg)))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            msg.rsplit('.').next()
        }
        _ => None,
    }
}

fn owner_key(caller: &CallerContext) -> String {
    format!(
        "owner:{}:{}",
        caller
            .user_id
            .map(|u| u.to_string())
            .unwrap_or_default(),
        caller.public_id.as_deref().unwrap_or_default()
    )
}

/// Random lowercase alphanumeric id of `len` characters.
pub fn random_id(len: usize) -> String {
    let len = len.clamp(1, super::identity::MAX_ID_LEN);
    let mut out = String::with_capacity(len);
    while out.len() < len {
        let bytes = uuid::Uuid::new_v4().into_bytes();
        // Bytes 6 and 8 carry the version and variant bits.
        for (i, b) in bytes.iter().enumerate() {
            if i == 6 || i == 8 || out.len() == len {
                continue;
            }
            out.push(ID_ALPHABET[*b as usize % ID_ALPHABET.len()] as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::{LaunchProfile, UnitState};
    use crate::sandbox::address::{AddressResolver, AddressingStrategy, Subnet};
    use crate::sandbox::identity::{NamingScheme, UnitNamer};
    use crate::sandbox::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Harness {
        registry: SandboxRegistry,
        runtime: Arc<FakeRuntime>,
        store: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let driver = SandboxDriver::new(
            runtime.clone(),
            UnitNamer::new("pg-", NamingScheme::Canonical),
            LaunchProfile {
                template: "base".to_string(),
                cpu: "1".to_string(),
                memory: "256MB".to_string(),
                processes: 64,
                nesting: false,
                syscall_intercepts: Vec::new(),
            },
            "/srv/sandbox",
        )
        .with_timing(Duration::ZERO, Duration::from_millis(10));
        let store = Arc::new(MemoryStore::new());
        let registry = SandboxRegistry::open(
            ":memory:",
            Arc::new(driver),
            store.clone(),
            RegistryOptions {
                storage_root: Some(dir.path().to_path_buf()),
                ..RegistryOptions::default()
            },
        )
        .unwrap();
        Harness {
            registry,
            runtime,
            store,
            _dir: dir,
        }
    }

    fn sandboxed(isolation: Isolation) -> CanonicalId {
        match isolation {
            Isolation::Sandboxed(id) => id,
            Isolation::Unconstrained => panic!("expected a sandbox"),
        }
    }

    #[test]
    fn test_random_id_shape() {
        for len in [1, 12, 20, 40] {
            let id = random_id(len);
            assert_eq!(id.len(), len);
            assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));
        }
        assert_ne!(random_id(12), random_id(12));
    }

    #[test]
    fn test_admin_gets_unconstrained() {
        let h = harness();
        let admin = CallerContext {
            is_admin: true,
            ..CallerContext::user(1)
        };
        assert_eq!(h.registry.find_or_create(&admin).unwrap(), Isolation::Unconstrained);

        let forced = CallerContext {
            force_sandbox: true,
            ..admin
        };
        assert!(matches!(
            h.registry.find_or_create(&forced).unwrap(),
            Isolation::Sandboxed(_)
        ));
    }

    #[test]
    fn test_find_or_create_is_stable_per_user() {
        let h = harness();
        let caller = CallerContext::user(42);
        let first = sandboxed(h.registry.find_or_create(&caller).unwrap());
        let second = sandboxed(h.registry.find_or_create(&caller).unwrap());
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 12);
        assert_eq!(h.registry.records_for(&caller).unwrap().len(), 1);
        assert_eq!(h.registry.record(&first).unwrap().unwrap().user_id, Some(42));
    }

    #[test]
    fn test_distinct_users_get_distinct_sandboxes() {
        let h = harness();
        let a = sandboxed(h.registry.find_or_create(&CallerContext::user(1)).unwrap());
        let b = sandboxed(h.registry.find_or_create(&CallerContext::user(2)).unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_stale_record_is_replaced() {
        let h = harness();
        let caller = CallerContext::user(7);
        let first = sandboxed(h.registry.find_or_create(&caller).unwrap());
        // Provisioned once, then the unit vanished behind our back.
        h.registry.mark_provisioned(&first).unwrap();
        assert!(!h.registry.validate(&first));

        let second = sandboxed(h.registry.find_or_create(&caller).unwrap());
        assert_ne!(first, second);
        assert!(h.registry.record(&first).unwrap().is_none());
    }

    #[test]
    fn test_provisioned_record_with_unit_is_kept() {
        let h = harness();
        let caller = CallerContext::user(8);
        let id = sandboxed(h.registry.find_or_create(&caller).unwrap());
        h.runtime
            .units
            .lock()
            .unwrap()
            .insert(format!("pg-{}", id), UnitState::Running);
        h.registry.mark_provisioned(&id).unwrap();
        assert!(h.registry.validate(&id));
        assert_eq!(sandboxed(h.registry.find_or_create(&caller).unwrap()), id);
    }

    #[test]
    fn test_validate_unknown_id() {
        let h = harness();
        assert!(!h.registry.validate(&CanonicalId::new("nobody")));
    }

    #[test]
    fn test_no_identity_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.registry.find_or_create(&CallerContext::default()),
            Err(RegistryError::NoIdentity)
        ));
    }

    #[test]
    fn test_session_sandbox_is_used_without_identity() {
        let h = harness();
        let id = sandboxed(h.registry.find_or_create(&CallerContext::user(3)).unwrap());
        let caller = CallerContext {
            session_sandbox: Some(id.to_string()),
            ..CallerContext::default()
        };
        assert_eq!(sandboxed(h.registry.find_or_create(&caller).unwrap()), id);
    }

    #[test]
    fn test_public_id_owner() {
        let h = harness();
        let caller = CallerContext {
            public_id: Some("pub-abc".to_string()),
            ..CallerContext::default()
        };
        let id = sandboxed(h.registry.find_or_create(&caller).unwrap());
        let record = h.registry.record(&id).unwrap().unwrap();
        assert!(record.is_owned_by(&caller));
        assert!(!record.is_owned_by(&CallerContext::user(1)));
    }

    #[test]
    fn test_unique_owner_constraint_blocks_second_insert() {
        let h = harness();
        let caller = CallerContext::user(9);
        h.registry.insert(&CanonicalId::new("first"), &caller).unwrap();
        let err = h
            .registry
            .insert(&CanonicalId::new("second"), &caller)
            .unwrap_err();
        assert_eq!(constraint_column(&err), Some("user_id"));
        assert_eq!(
            sandboxed(h.registry.find_or_create(&caller).unwrap()).as_str(),
            "first"
        );
    }

    #[test]
    fn test_teardown_then_again_is_idempotent() {
        let h = harness();
        let id = sandboxed(h.registry.find_or_create(&CallerContext::user(42)).unwrap());
        h.runtime
            .units
            .lock()
            .unwrap()
            .insert(format!("pg-{}", id), UnitState::Running);
        h.store.set(&format!("agent:{}:requests", id), "3").unwrap();

        let first = h.registry.teardown(&id);
        assert_eq!(
            first.deleted,
            vec![
                TeardownStep::Container,
                TeardownStep::Cache,
                TeardownStep::Database,
                TeardownStep::Directory
            ]
        );
        assert!(first.errors.is_empty());
        assert!(first.success);
        assert!(!h.registry.validate(&id));

        let second = h.registry.teardown(&id);
        assert!(second.deleted.is_empty());
        assert_eq!(second.already_gone.len(), 4);
        assert!(second.errors.is_empty());
        assert!(second.success);
    }

    #[test]
    fn test_teardown_after_resolution_leaves_no_metrics_behind() {
        let Harness {
            registry,
            runtime,
            store,
            _dir,
        } = harness();
        let resolver = AddressResolver::new(
            AddressingStrategy::Deterministic,
            Subnet::default(),
            store.clone(),
            runtime.clone(),
            UnitNamer::new("pg-", NamingScheme::Canonical),
        );
        let registry = registry.with_recorder(resolver.recorder().clone());

        for owner in 0..25 {
            let id = sandboxed(registry.find_or_create(&CallerContext::user(owner)).unwrap());
            for _ in 0..4 {
                resolver.resolve(&id);
            }
            let first = registry.teardown(&id);
            assert!(first.deleted.contains(&TeardownStep::Cache));

            let second = registry.teardown(&id);
            assert!(second.deleted.is_empty(), "second teardown: {:?}", second);
            assert!(second.already_gone.contains(&TeardownStep::Cache));
            resolver.recorder().flush();
            assert_eq!(store.get(&format!("agent:{}:requests", id)).unwrap(), None);
        }
    }

    #[test]
    fn test_poisoned_lock_is_reported_as_such() {
        let h = harness();
        std::thread::scope(|s| {
            let _ = s
                .spawn(|| {
                    let _guard = h.registry.conn.lock().unwrap();
                    panic!("poison the registry lock");
                })
                .join();
        });
        let err = h
            .registry
            .insert(&CanonicalId::new("after"), &CallerContext::user(3))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Poisoned(_)));
        assert_eq!(constraint_column(&err), None);
    }

    #[test]
    fn test_teardown_continues_after_failed_step() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime {
            broken: true,
            ..FakeRuntime::new()
        });
        let driver = SandboxDriver::new(
            runtime,
            UnitNamer::new("pg-", NamingScheme::Canonical),
            LaunchProfile {
                template: "base".to_string(),
                cpu: "1".to_string(),
                memory: "1GB".to_string(),
                processes: 1,
                nesting: false,
                syscall_intercepts: Vec::new(),
            },
            "/srv",
        );
        let registry = SandboxRegistry::open(
            ":memory:",
            Arc::new(driver),
            Arc::new(MemoryStore::new()),
            RegistryOptions {
                storage_root: Some(dir.path().to_path_buf()),
                ..RegistryOptions::default()
            },
        )
        .unwrap();
        let id = sandboxed(registry.find_or_create(&CallerContext::user(5)).unwrap());

        let report = registry.teardown(&id);
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].step, TeardownStep::Container);
        assert!(report.deleted.contains(&TeardownStep::Database));
        assert!(report.deleted.contains(&TeardownStep::Directory));
    }
}
