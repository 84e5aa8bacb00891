//! SQLite-backed rule store.
//!
//! # Schema
//! ```text
//! failure_association_rules(
//!   project, rule_id,            -- primary key
//!   rule_definition,
//!   bug_system, bug_id,
//!   creation_time, creation_user,
//!   last_updated, last_updated_user,
//!   is_active,
//!   source_cluster_algorithm, source_cluster_id)
//! ```
//! Timestamps are stored as microseconds since the Unix epoch. `last_updated`
//! is assigned on write and strictly increases within a project, so it
//! doubles as the project's rules version.
//!
//! # Connections
//! Writes are serialized on a single writer connection. Each read
//! transaction runs on its own reader connection, taken from a small idle
//! pool or opened on demand, inside `BEGIN DEFERRED` / `ROLLBACK`. The
//! rollback is issued from `Drop`, so the snapshot is released on every exit
//! path, and the connection goes back to the pool afterwards.
//!
//! On-disk stores run in WAL mode: readers never wait on each other or on the
//! writer. In-memory stores share one database through SQLite's shared cache,
//! where reads still run in parallel but a write fails with `SQLITE_LOCKED`
//! while a read transaction is open.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::validation::{validate_project, validate_rule, validate_rule_id, validate_user};
use super::{ReadContext, ReadTransaction, RuleStore};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::rule::{BugId, ClusterId, DeltaRecord, FailureAssociationRule, RuleRecord};
use crate::types::starting_epoch;

/// Rows between cancellation checks while streaming results.
const CHECK_EVERY_ROWS: usize = 256;

/// Idle reader connections kept for reuse.
const MAX_IDLE_READERS: usize = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS failure_association_rules (
        project TEXT NOT NULL,
        rule_id TEXT NOT NULL,
        rule_definition TEXT NOT NULL,
        bug_system TEXT NOT NULL,
        bug_id TEXT NOT NULL,
        creation_time INTEGER NOT NULL,
        creation_user TEXT NOT NULL,
        last_updated INTEGER NOT NULL,
        last_updated_user TEXT NOT NULL,
        is_active INTEGER NOT NULL,
        source_cluster_algorithm TEXT NOT NULL DEFAULT '',
        source_cluster_id TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (project, rule_id)
    );
    CREATE INDEX IF NOT EXISTS idx_rules_project_last_updated
        ON failure_association_rules(project, last_updated);
    CREATE INDEX IF NOT EXISTS idx_rules_bug
        ON failure_association_rules(bug_system, bug_id);
";

const SELECT_COLUMNS: &str = "project, rule_id, rule_definition, bug_system, bug_id, \
     creation_time, creation_user, last_updated, last_updated_user, is_active, \
     source_cluster_algorithm, source_cluster_id";

fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", micros)))
}

/// Where reader connections are opened.
enum Target {
    File(PathBuf),
    /// URI of a named shared-cache in-memory database.
    SharedMemory(String),
}

/// Persistent rule store.
pub struct SqliteRuleStore {
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    target: Target,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteRuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRuleStore").finish_non_exhaustive()
    }
}

impl SqliteRuleStore {
    /// Opens or creates a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("failed to create directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        // WAL keeps readers on a stable snapshot while writers commit.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::with_writer(conn, Target::File(path.to_path_buf()), clock)
    }

    /// Opens a private in-memory database.
    ///
    /// The database lives as long as the store.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let uri = format!(
            "file:rulecache-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let conn = Connection::open(&uri)?;
        Self::with_writer(conn, Target::SharedMemory(uri), clock)
    }

    fn with_writer(
        conn: Connection,
        target: Target,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            target,
            clock,
        })
    }

    fn open_reader(&self) -> Result<Connection, StoreError> {
        let conn = match &self.target {
            Target::File(path) => Connection::open(path)?,
            Target::SharedMemory(uri) => Connection::open(uri)?,
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(conn)
    }

    /// Starts a read transaction on a pooled or freshly opened connection.
    fn begin_read(&self) -> Result<SqliteReadTransaction<'_>, StoreError> {
        let pooled = self.readers.lock().pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => self.open_reader()?,
        };
        conn.execute_batch("BEGIN DEFERRED")?;
        Ok(SqliteReadTransaction {
            store: self,
            conn: Some(conn),
        })
    }

    fn release_reader(&self, conn: Connection) {
        let mut idle = self.readers.lock();
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
    }

    // ============================================================================================
    // WRITES
    // ============================================================================================

    /// Inserts a new rule.
    ///
    /// Creation and last-updated audit fields are assigned by the store; the
    /// stored rule is returned.
    pub fn create_rule(
        &self,
        rule: &FailureAssociationRule,
        user: &str,
    ) -> Result<FailureAssociationRule, StoreError> {
        validate_rule(rule)?;
        validate_user(user)?;

        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        if Self::read_rule_in(&tx, &rule.project, &rule.rule_id)?.is_some() {
            return Err(StoreError::Validation(format!(
                "rule {} already exists",
                rule.rule_id
            )));
        }

        let now = Self::next_timestamp(&tx, &rule.project, self.clock.now())?;
        tx.execute(
            "INSERT INTO failure_association_rules (
                project, rule_id, rule_definition, bug_system, bug_id,
                creation_time, creation_user, last_updated, last_updated_user, is_active,
                source_cluster_algorithm, source_cluster_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rule.project,
                rule.rule_id,
                rule.rule_definition,
                rule.bug_id.system,
                rule.bug_id.id,
                now,
                user,
                now,
                user,
                rule.is_active,
                rule.source_cluster.algorithm,
                rule.source_cluster.id,
            ],
        )?;
        let stored = Self::read_rule_in(&tx, &rule.project, &rule.rule_id)?;
        tx.commit()?;

        debug!("Created rule {}/{}", rule.project, rule.rule_id);
        stored.ok_or_else(|| StoreError::Corrupt("rule missing after insert".to_string()))
    }

    /// Updates the definition, bug, activity and source cluster of an
    /// existing rule.
    pub fn update_rule(
        &self,
        rule: &FailureAssociationRule,
        user: &str,
    ) -> Result<FailureAssociationRule, StoreError> {
        validate_rule(rule)?;
        validate_user(user)?;

        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        if Self::read_rule_in(&tx, &rule.project, &rule.rule_id)?.is_none() {
            return Err(StoreError::NotFound {
                project: rule.project.clone(),
                rule_id: rule.rule_id.clone(),
            });
        }

        let now = Self::next_timestamp(&tx, &rule.project, self.clock.now())?;
        tx.execute(
            "UPDATE failure_association_rules
             SET rule_definition = ?3, bug_system = ?4, bug_id = ?5,
                 last_updated = ?6, last_updated_user = ?7, is_active = ?8,
                 source_cluster_algorithm = ?9, source_cluster_id = ?10
             WHERE project = ?1 AND rule_id = ?2",
            params![
                rule.project,
                rule.rule_id,
                rule.rule_definition,
                rule.bug_id.system,
                rule.bug_id.id,
                now,
                user,
                rule.is_active,
                rule.source_cluster.algorithm,
                rule.source_cluster.id,
            ],
        )?;
        let stored = Self::read_rule_in(&tx, &rule.project, &rule.rule_id)?;
        tx.commit()?;

        debug!("Updated rule {}/{}", rule.project, rule.rule_id);
        stored.ok_or_else(|| StoreError::Corrupt("rule missing after update".to_string()))
    }

    // ============================================================================================
    // LOOKUPS
    // ============================================================================================

    /// Reads one rule, active or not.
    pub fn read_rule(
        &self,
        project: &str,
        rule_id: &str,
    ) -> Result<FailureAssociationRule, StoreError> {
        validate_project(project)?;
        validate_rule_id(rule_id)?;
        let txn = self.begin_read()?;
        let rule = Self::read_rule_in(txn.conn()?, project, rule_id)?;
        rule.ok_or_else(|| StoreError::NotFound {
            project: project.to_string(),
            rule_id: rule_id.to_string(),
        })
    }

    /// Reads the rule associated with a bug, in any project, active or not.
    ///
    /// If several rules share the bug, one of them is returned.
    pub fn read_by_bug(&self, bug: &BugId) -> Result<FailureAssociationRule, StoreError> {
        let txn = self.begin_read()?;
        let sql = format!(
            "SELECT {} FROM failure_association_rules
             WHERE bug_system = ?1 AND bug_id = ?2
             LIMIT 1",
            SELECT_COLUMNS
        );
        let raw = txn
            .conn()?
            .query_row(&sql, params![bug.system, bug.id], RawRule::from_row)
            .optional()?;
        match raw {
            Some(raw) => raw.into_rule(),
            None => Err(StoreError::BugNotFound(bug.to_string())),
        }
    }

    /// Reads the given rules of a project from one snapshot.
    ///
    /// The result has one entry per requested ID, in request order, with
    /// `None` for rules that do not exist. Repeated IDs yield independent
    /// copies.
    pub fn read_many<S: AsRef<str>>(
        &self,
        project: &str,
        rule_ids: &[S],
    ) -> Result<Vec<Option<FailureAssociationRule>>, StoreError> {
        validate_project(project)?;
        let txn = self.begin_read()?;
        let conn = txn.conn()?;
        rule_ids
            .iter()
            .map(|id| Self::read_rule_in(conn, project, id.as_ref()))
            .collect()
    }

    fn read_rule_in(
        conn: &Connection,
        project: &str,
        rule_id: &str,
    ) -> Result<Option<FailureAssociationRule>, StoreError> {
        let sql = format!(
            "SELECT {} FROM failure_association_rules WHERE project = ?1 AND rule_id = ?2",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let raw = stmt
            .query_row(params![project, rule_id], RawRule::from_row)
            .optional()?;
        raw.map(RawRule::into_rule).transpose()
    }

    /// Picks a commit timestamp strictly after every existing one in the project.
    fn next_timestamp(
        conn: &Connection,
        project: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(last_updated) FROM failure_association_rules WHERE project = ?1",
            params![project],
            |row| row.get(0),
        )?;
        let now = to_micros(now);
        Ok(match latest {
            Some(latest) if latest >= now => latest + 1,
            _ => now,
        })
    }
}

impl RuleStore for SqliteRuleStore {
    fn read_only_transaction(
        &self,
        ctx: &ReadContext,
    ) -> Result<Box<dyn ReadTransaction + '_>, StoreError> {
        ctx.check()?;
        Ok(Box::new(self.begin_read()?))
    }
}

struct SqliteReadTransaction<'a> {
    store: &'a SqliteRuleStore,
    /// Taken back in `Drop`.
    conn: Option<Connection>,
}

impl SqliteReadTransaction<'_> {
    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("read transaction released".to_string()))
    }
}

impl Drop for SqliteReadTransaction<'_> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => self.store.release_reader(conn),
            // The connection is closed rather than reused mid-transaction.
            Err(e) => warn!("Failed to release read transaction: {}", e),
        }
    }
}

impl ReadTransaction for SqliteReadTransaction<'_> {
    fn read_active(
        &mut self,
        ctx: &ReadContext,
        project: &str,
    ) -> Result<Vec<RuleRecord>, StoreError> {
        ctx.check()?;
        let mut stmt = self.conn()?.prepare(
            "SELECT rule_id, last_updated, rule_definition
             FROM failure_association_rules
             WHERE project = ?1 AND is_active = 1",
        )?;
        let mut rows = stmt.query(params![project])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            if records.len() % CHECK_EVERY_ROWS == 0 {
                ctx.check()?;
            }
            records.push(RuleRecord {
                rule_id: row.get(0)?,
                last_updated: from_micros(row.get(1)?)?,
                rule_definition: row.get(2)?,
            });
        }
        Ok(records)
    }

    fn read_delta(
        &mut self,
        ctx: &ReadContext,
        project: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeltaRecord>, StoreError> {
        ctx.check()?;
        if since < starting_epoch() {
            return Err(StoreError::InvalidArgument(
                "cannot query rule deltas from before project inception".to_string(),
            ));
        }
        let mut stmt = self.conn()?.prepare(
            "SELECT rule_id, last_updated, rule_definition, is_active
             FROM failure_association_rules
             WHERE project = ?1 AND last_updated > ?2",
        )?;
        let mut rows = stmt.query(params![project, to_micros(since)])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            if records.len() % CHECK_EVERY_ROWS == 0 {
                ctx.check()?;
            }
            records.push(DeltaRecord {
                rule_id: row.get(0)?,
                last_updated: from_micros(row.get(1)?)?,
                rule_definition: row.get(2)?,
                is_active: row.get(3)?,
            });
        }
        Ok(records)
    }

    fn read_last_updated(
        &mut self,
        ctx: &ReadContext,
        project: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        ctx.check()?;
        let latest: Option<i64> = self.conn()?.query_row(
            "SELECT MAX(last_updated) FROM failure_association_rules WHERE project = ?1",
            params![project],
            |row| row.get(0),
        )?;
        match latest {
            Some(micros) => from_micros(micros),
            None => Ok(starting_epoch()),
        }
    }
}

/// A row as stored, before timestamp conversion.
struct RawRule {
    project: String,
    rule_id: String,
    rule_definition: String,
    bug_system: String,
    bug_id: String,
    creation_time: i64,
    creation_user: String,
    last_updated: i64,
    last_updated_user: String,
    is_active: bool,
    source_cluster_algorithm: String,
    source_cluster_id: String,
}

impl RawRule {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project: row.get(0)?,
            rule_id: row.get(1)?,
            rule_definition: row.get(2)?,
            bug_system: row.get(3)?,
            bug_id: row.get(4)?,
            creation_time: row.get(5)?,
            creation_user: row.get(6)?,
            last_updated: row.get(7)?,
            last_updated_user: row.get(8)?,
            is_active: row.get(9)?,
            source_cluster_algorithm: row.get(10)?,
            source_cluster_id: row.get(11)?,
        })
    }

    fn into_rule(self) -> Result<FailureAssociationRule, StoreError> {
        Ok(FailureAssociationRule {
            project: self.project,
            rule_id: self.rule_id,
            rule_definition: self.rule_definition,
            bug_id: BugId {
                system: self.bug_system,
                id: self.bug_id,
            },
            is_active: self.is_active,
            creation_time: from_micros(self.creation_time)?,
            creation_user: self.creation_user,
            last_updated: from_micros(self.last_updated)?,
            last_updated_user: self.last_updated_user,
            source_cluster: ClusterId {
                algorithm: self.source_cluster_algorithm,
                id: self.source_cluster_id,
            },
        })
    }
}
