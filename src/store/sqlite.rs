use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, TransactionBehavior};

use super::{Assignment, AssignmentStore, InsertOutcome};
use crate::{context::UserContext, experiment::Timestamp, Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS assignments (
  test_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  variant_id TEXT NOT NULL CHECK (length(variant_id) > 0),
  session_id TEXT NOT NULL,
  experiment_version INTEGER NOT NULL CHECK (experiment_version >= 0),
  context_snapshot TEXT NOT NULL DEFAULT '{}',
  assigned_at TEXT NOT NULL,
  last_seen_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_test_user
  ON assignments(test_id, user_id);
";

const SELECT_ASSIGNMENT: &str = "SELECT test_id, user_id, variant_id, session_id, experiment_version,
        context_snapshot, assigned_at, last_seen_at
   FROM assignments
  WHERE test_id = ?1 AND user_id = ?2";

/// SQLite-backed [`AssignmentStore`].
///
/// Every conditional write runs in an `IMMEDIATE` transaction against a unique index on
/// `(test_id, user_id)`, so several processes (replicas) may share one database file. Cloning the
/// store shares the underlying connection.
#[derive(Clone)]
pub struct SqliteAssignmentStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteAssignmentStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let connection = Connection::open(path)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        log::debug!(target: "abkit", path:display = path.display(); "opened sqlite assignment store");
        SqliteAssignmentStore::from_connection(connection)
    }

    /// A private in-memory database. Mostly useful for tests.
    pub fn open_in_memory() -> Result<Self> {
        SqliteAssignmentStore::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.execute_batch(SCHEMA_V1)?;
        Ok(SqliteAssignmentStore {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".into()))
    }
}

impl AssignmentStore for SqliteAssignmentStore {
    fn get_existing(&self, test_id: &str, user_id: &str) -> Result<Option<Assignment>> {
        let connection = self.lock()?;
        let assignment = connection
            .query_row(SELECT_ASSIGNMENT, params![test_id, user_id], parse_assignment_row)
            .optional()?;
        Ok(assignment)
    }

    fn create_if_absent(&self, candidate: Assignment) -> Result<InsertOutcome> {
        let mut connection = self.lock()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = insert_if_absent(&tx, &candidate)?;
        let stored = tx.query_row(
            SELECT_ASSIGNMENT,
            params![candidate.test_id, candidate.user_id],
            parse_assignment_row,
        )?;
        tx.commit()?;

        Ok(if inserted {
            InsertOutcome::Created(stored)
        } else {
            InsertOutcome::Existing(stored)
        })
    }

    fn replace_if_version(
        &self,
        candidate: Assignment,
        expected_version: u32,
    ) -> Result<InsertOutcome> {
        let mut connection = self.lock()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let replaced = tx.execute(
            "UPDATE assignments
                SET variant_id = ?3, session_id = ?4, experiment_version = ?5,
                    context_snapshot = ?6, assigned_at = ?7, last_seen_at = NULL
              WHERE test_id = ?1 AND user_id = ?2 AND experiment_version = ?8
                AND experiment_version < ?5",
            params![
                candidate.test_id,
                candidate.user_id,
                candidate.variant_id,
                candidate.session_id,
                i64::from(candidate.experiment_version),
                snapshot_json(&candidate.context_snapshot)?,
                format_timestamp(candidate.assigned_at),
                i64::from(expected_version),
            ],
        )? == 1;
        let written = replaced || insert_if_absent(&tx, &candidate)?;

        let stored = tx.query_row(
            SELECT_ASSIGNMENT,
            params![candidate.test_id, candidate.user_id],
            parse_assignment_row,
        )?;
        tx.commit()?;

        Ok(if written {
            InsertOutcome::Created(stored)
        } else {
            InsertOutcome::Existing(stored)
        })
    }

    fn touch(&self, test_id: &str, user_id: &str, at: Timestamp) -> Result<()> {
        let connection = self.lock()?;
        connection.execute(
            "UPDATE assignments SET last_seen_at = ?3 WHERE test_id = ?1 AND user_id = ?2",
            params![test_id, user_id, format_timestamp(at)],
        )?;
        Ok(())
    }
}

/// Returns `true` if the row was written, `false` if `(test_id, user_id)` already existed.
fn insert_if_absent(connection: &Connection, candidate: &Assignment) -> Result<bool> {
    let changed = connection.execute(
        "INSERT INTO assignments(
            test_id, user_id, variant_id, session_id, experiment_version,
            context_snapshot, assigned_at, last_seen_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
         ON CONFLICT(test_id, user_id) DO NOTHING",
        params![
            candidate.test_id,
            candidate.user_id,
            candidate.variant_id,
            candidate.session_id,
            i64::from(candidate.experiment_version),
            snapshot_json(&candidate.context_snapshot)?,
            format_timestamp(candidate.assigned_at),
        ],
    )?;
    Ok(changed == 1)
}

fn snapshot_json(context: &UserContext) -> Result<String> {
    serde_json::to_string(context)
        .map_err(|err| Error::Storage(format!("failed to serialize context snapshot: {err}")))
}

fn format_timestamp(timestamp: Timestamp) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<Timestamp> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn parse_assignment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Assignment> {
    let version: i64 = row.get(4)?;
    let snapshot_raw: String = row.get(5)?;
    let assigned_at_raw: String = row.get(6)?;
    let last_seen_at_raw: Option<String> = row.get(7)?;

    let experiment_version = u32::try_from(version)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(4, Type::Integer, Box::new(err)))?;
    let context_snapshot = serde_json::from_str(&snapshot_raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(err)))?;

    Ok(Assignment {
        test_id: row.get(0)?,
        user_id: row.get(1)?,
        variant_id: row.get(2)?,
        session_id: row.get(3)?,
        experiment_version,
        context_snapshot,
        assigned_at: parse_timestamp(6, &assigned_at_raw)?,
        last_seen_at: last_seen_at_raw
            .as_deref()
            .map(|raw| parse_timestamp(7, raw))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{Arc, Barrier},
        time::{SystemTime, UNIX_EPOCH},
    };

    use chrono::Utc;

    use super::SqliteAssignmentStore;
    use crate::store::{
        test_support::{assert_single_winner, candidate, race_create},
        AssignmentStore,
    };

    fn temp_db_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "abkit-{name}-{}-{nanos}.sqlite3",
            std::process::id()
        ))
    }

    fn remove_db(path: &PathBuf) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }

    #[test]
    fn roundtrips_assignment() {
        let store = SqliteAssignmentStore::open_in_memory().unwrap();
        let candidate = candidate("exp", "user-1", "A", 3);

        let outcome = store.create_if_absent(candidate.clone()).unwrap();
        assert!(outcome.is_created());
        assert_eq!(outcome.assignment(), &candidate);

        let stored = store.get_existing("exp", "user-1").unwrap().unwrap();
        assert_eq!(stored, candidate);
        assert_eq!(stored.context_snapshot.device_type.as_deref(), Some("mobile"));
    }

    #[test]
    fn first_write_wins() {
        let store = SqliteAssignmentStore::open_in_memory().unwrap();
        store
            .create_if_absent(candidate("exp", "user-1", "A", 1))
            .unwrap();

        let second = store
            .create_if_absent(candidate("exp", "user-1", "B", 1))
            .unwrap();
        assert!(!second.is_created());
        assert_eq!(second.assignment().variant_id, "A");
    }

    #[test]
    fn concurrent_creates_on_shared_connection_converge() {
        let store = Arc::new(SqliteAssignmentStore::open_in_memory().unwrap());
        let results = race_create(store, 8);
        assert_single_winner(&results);
    }

    #[test]
    fn concurrent_creates_across_connections_converge() {
        // Each thread opens its own connection to one file, like separate replicas would.
        let path = temp_db_path("race");
        SqliteAssignmentStore::open(&path).unwrap();

        let k = 6;
        let barrier = Arc::new(Barrier::new(k));
        let handles: Vec<_> = (0..k)
            .map(|i| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let store = SqliteAssignmentStore::open(&path).unwrap();
                    barrier.wait();
                    let outcome = store
                        .create_if_absent(candidate("race", "user-1", &format!("V{i}"), 1))
                        .unwrap();
                    (outcome.is_created(), outcome.into_assignment())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_single_winner(&results);
        remove_db(&path);
    }

    #[test]
    fn survives_reopen() {
        let path = temp_db_path("reopen");
        {
            let store = SqliteAssignmentStore::open(&path).unwrap();
            store
                .create_if_absent(candidate("exp", "user-1", "B", 2))
                .unwrap();
        }

        let store = SqliteAssignmentStore::open(&path).unwrap();
        let stored = store.get_existing("exp", "user-1").unwrap().unwrap();
        assert_eq!(stored.variant_id, "B");
        assert_eq!(stored.experiment_version, 2);
        remove_db(&path);
    }

    #[test]
    fn replace_only_matching_version() {
        let store = SqliteAssignmentStore::open_in_memory().unwrap();
        store
            .create_if_absent(candidate("exp", "user-1", "A", 1))
            .unwrap();

        let stale = store
            .replace_if_version(candidate("exp", "user-1", "C", 3), 2)
            .unwrap();
        assert!(!stale.is_created());
        assert_eq!(stale.assignment().variant_id, "A");

        let replaced = store
            .replace_if_version(candidate("exp", "user-1", "B", 2), 1)
            .unwrap();
        assert!(replaced.is_created());
        assert_eq!(replaced.assignment().variant_id, "B");
        assert_eq!(replaced.assignment().experiment_version, 2);

        let fresh = store
            .replace_if_version(candidate("exp", "user-2", "A", 2), 1)
            .unwrap();
        assert!(fresh.is_created());
    }

    #[test]
    fn replace_never_downgrades_a_row() {
        let store = SqliteAssignmentStore::open_in_memory().unwrap();
        store
            .create_if_absent(candidate("exp", "user-1", "A", 3))
            .unwrap();

        for version in [2, 3] {
            let outcome = store
                .replace_if_version(candidate("exp", "user-1", "B", version), 3)
                .unwrap();
            assert!(!outcome.is_created());
            assert_eq!(outcome.assignment().variant_id, "A");
        }

        let stored = store.get_existing("exp", "user-1").unwrap().unwrap();
        assert_eq!(stored.variant_id, "A");
        assert_eq!(stored.experiment_version, 3);
    }

    #[test]
    fn touch_sets_last_seen() {
        let store = SqliteAssignmentStore::open_in_memory().unwrap();
        store
            .create_if_absent(candidate("exp", "user-1", "A", 1))
            .unwrap();
        let now = Utc::now();
        store.touch("exp", "user-1", now).unwrap();

        let stored = store.get_existing("exp", "user-1").unwrap().unwrap();
        assert_eq!(stored.last_seen_at, Some(now));
        assert_eq!(stored.variant_id, "A");
    }
}
