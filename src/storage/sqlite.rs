//! SQLite Persistent Storage for Accounts
//!
//! Provides durable storage for accounts, their branch counters and issued
//! control programs. Counters survive restarts, so an index handed out once
//! is never handed out again.
//! Uses connection pooling via r2d2 for concurrent access. Every query runs
//! on the blocking thread pool, and waits on a locked database are capped by
//! the caller's deadline.

use async_trait::async_trait;
use bitcoin::bip32::Xpub;
use bitcoin::{Script, ScriptBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{AccountStore, StorageError, StorageResult};
use crate::context::current_deadline;
use crate::types::{Account, Branch, ControlProgram, NextIndex};

/// How long a query waits on a locked database before failing
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed account store with connection pooling
#[derive(Clone)]
pub struct SqliteAccountStore {
    pool: Pool<SqliteConnectionManager>,
    busy_timeout: Duration,
}

impl SqliteAccountStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        tracing::debug!(
            target: "receivers::storage",
            path = %db_path.as_ref().display(),
            "Opening SQLite account store"
        );

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };
        store.run_migrations()?;

        Ok(store)
    }

    /// Cap on how long any single query waits for a database lock
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(Self::db_error)?;
        Ok(conn)
    }

    /// Busy timeout for the next call, never past the caller's deadline
    fn call_timeout(&self) -> Result<Duration, StorageError> {
        let Some(deadline) = current_deadline() else {
            return Ok(self.busy_timeout);
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(StorageError::Timeout(
                "deadline passed before storage call".to_string(),
            ));
        }
        Ok(remaining.min(self.busy_timeout))
    }

    /// Run a synchronous query on the blocking pool
    async fn run_blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteAccountStore) -> StorageResult<T> + Send + 'static,
    {
        let mut store = self.clone();
        store.busy_timeout = self.call_timeout()?;

        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StorageError::Database(format!("storage task failed: {}", e)))?
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                alias TEXT UNIQUE,
                xpubs TEXT NOT NULL,
                quorum INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS account_indexes (
                account_id TEXT NOT NULL REFERENCES accounts(id),
                branch TEXT NOT NULL,
                next_index INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (account_id, branch)
            );

            CREATE TABLE IF NOT EXISTS control_programs (
                program TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id),
                branch TEXT NOT NULL,
                key_index INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                UNIQUE (account_id, branch, key_index)
            );

            CREATE INDEX IF NOT EXISTS idx_control_programs_account ON control_programs(account_id);
            "#,
        )
        .map_err(Self::db_error)?;

        Ok(())
    }

    /// Map a constraint violation to `Duplicate`, anything else to `Database`
    fn map_write_error(e: rusqlite::Error, what: impl FnOnce() -> String) -> StorageError {
        if let rusqlite::Error::SqliteFailure(ref err, _) = e {
            if err.extended_code == 1555 || err.extended_code == 2067 {
                return StorageError::Duplicate(what());
            }
        }
        Self::db_error(e)
    }

    /// A lock still held when the busy timeout ran out is a timeout
    fn db_error(e: rusqlite::Error) -> StorageError {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StorageError::Timeout(e.to_string())
            }
            _ => StorageError::Database(e.to_string()),
        }
    }

    fn format_time(t: &DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    fn parse_time(s: &str) -> Result<DateTime<Utc>, StorageError> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::InvalidData(format!("timestamp {}: {}", s, e)))
    }

    fn parse_branch(s: &str) -> Result<Branch, StorageError> {
        s.parse().map_err(StorageError::InvalidData)
    }

    /// Raw account columns, decoded outside the rusqlite row closure
    fn row_to_account_parts(
        row: &rusqlite::Row,
    ) -> rusqlite::Result<(String, Option<String>, String, i64, String)> {
        Ok((
            row.get("id")?,
            row.get("alias")?,
            row.get("xpubs")?,
            row.get("quorum")?,
            row.get("created_at")?,
        ))
    }

    /// Raw program columns, decoded outside the rusqlite row closure
    fn row_to_program_parts(
        row: &rusqlite::Row,
    ) -> rusqlite::Result<(String, String, String, i64, String, Option<String>)> {
        Ok((
            row.get("program")?,
            row.get("account_id")?,
            row.get("branch")?,
            row.get("key_index")?,
            row.get("created_at")?,
            row.get("expires_at")?,
        ))
    }

    fn decode_program(
        parts: (String, String, String, i64, String, Option<String>),
    ) -> Result<ControlProgram, StorageError> {
        let (program_hex, account_id, branch, key_index, created_at, expires_at) = parts;

        let program = hex::decode(&program_hex)
            .map(ScriptBuf::from_bytes)
            .map_err(|e| StorageError::InvalidData(format!("program hex: {}", e)))?;

        Ok(ControlProgram {
            account_id,
            branch: Self::parse_branch(&branch)?,
            index: u32::try_from(key_index)
                .map_err(|_| StorageError::InvalidData(format!("key index {}", key_index)))?,
            program,
            created_at: Self::parse_time(&created_at)?,
            expires_at: expires_at.as_deref().map(Self::parse_time).transpose()?,
        })
    }

    fn load_next_index(
        conn: &rusqlite::Connection,
        account_id: &str,
    ) -> Result<NextIndex, StorageError> {
        let mut stmt = conn
            .prepare("SELECT branch, next_index FROM account_indexes WHERE account_id = ?1")
            .map_err(Self::db_error)?;

        let rows = stmt
            .query_map(params![account_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(Self::db_error)?;

        let mut next = NextIndex::default();
        for row in rows {
            let (branch, value) = row.map_err(Self::db_error)?;
            let value = u32::try_from(value)
                .map_err(|_| StorageError::InvalidData(format!("next index {}", value)))?;
            next.set(Self::parse_branch(&branch)?, value);
        }

        Ok(next)
    }

    fn decode_account(
        conn: &rusqlite::Connection,
        parts: (String, Option<String>, String, i64, String),
    ) -> Result<Account, StorageError> {
        let (id, alias, xpubs_json, quorum, created_at) = parts;

        let encoded: Vec<String> = serde_json::from_str(&xpubs_json)
            .map_err(|e| StorageError::InvalidData(format!("xpubs: {}", e)))?;
        let xpubs = encoded
            .iter()
            .map(|s| Xpub::from_str(s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::InvalidData(format!("xpub: {}", e)))?;

        let next_index = Self::load_next_index(conn, &id)?;

        Ok(Account {
            id,
            alias,
            xpubs,
            quorum: u8::try_from(quorum)
                .map_err(|_| StorageError::InvalidData(format!("quorum {}", quorum)))?,
            next_index,
            created_at: Self::parse_time(&created_at)?,
        })
    }

    // Synchronous helper methods for the trait implementations

    fn insert_account_sync(&self, account: &Account) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(Self::db_error)?;

        let xpubs: Vec<String> = account.xpubs.iter().map(|x| x.to_string()).collect();
        let xpubs_json =
            serde_json::to_string(&xpubs).map_err(|e| StorageError::InvalidData(e.to_string()))?;

        tx.execute(
            r#"
            INSERT INTO accounts (id, alias, xpubs, quorum, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                account.id,
                account.alias,
                xpubs_json,
                account.quorum as i64,
                Self::format_time(&account.created_at),
            ],
        )
        .map_err(|e| {
            Self::map_write_error(e, || match &account.alias {
                Some(alias) => format!("account {} / alias {}", account.id, alias),
                None => format!("account {}", account.id),
            })
        })?;

        for branch in Branch::ALL {
            tx.execute(
                "INSERT INTO account_indexes (account_id, branch, next_index) VALUES (?1, ?2, ?3)",
                params![
                    account.id,
                    branch.to_string(),
                    account.next_index.get(branch) as i64
                ],
            )
            .map_err(Self::db_error)?;
        }

        tx.commit()
            .map_err(Self::db_error)?;

        Ok(())
    }

    fn get_account_where_sync(
        &self,
        clause: &str,
        value: &str,
    ) -> Result<Option<Account>, StorageError> {
        let conn = self.conn()?;

        let parts = conn
            .query_row(
                &format!("SELECT * FROM accounts WHERE {} = ?1", clause),
                params![value],
                |row| Self::row_to_account_parts(row),
            )
            .optional()
            .map_err(Self::db_error)?;

        parts.map(|p| Self::decode_account(&conn, p)).transpose()
    }

    fn compare_and_swap_sync(
        &self,
        account_id: &str,
        branch: Branch,
        expected: u32,
        new: u32,
    ) -> Result<bool, StorageError> {
        let conn = self.conn()?;

        let rows_affected = conn
            .execute(
                r#"
            UPDATE account_indexes SET next_index = ?4
            WHERE account_id = ?1 AND branch = ?2 AND next_index = ?3
            "#,
                params![account_id, branch.to_string(), expected as i64, new as i64],
            )
            .map_err(Self::db_error)?;

        if rows_affected == 1 {
            return Ok(true);
        }

        // Distinguish a lost race from a missing account.
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM account_indexes WHERE account_id = ?1 AND branch = ?2",
                params![account_id, branch.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Self::db_error)?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound(account_id.to_string())),
        }
    }

    fn insert_control_program_sync(&self, program: &ControlProgram) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO control_programs (
                program, account_id, branch, key_index, created_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                program.program_hex(),
                program.account_id,
                program.branch.to_string(),
                program.index as i64,
                Self::format_time(&program.created_at),
                program.expires_at.as_ref().map(Self::format_time),
            ],
        )
        .map_err(|e| {
            Self::map_write_error(e, || {
                format!(
                    "index {} on {} branch of {}",
                    program.index, program.branch, program.account_id
                )
            })
        })?;

        Ok(())
    }

    fn get_control_program_sync(
        &self,
        program: &Script,
    ) -> Result<Option<ControlProgram>, StorageError> {
        let conn = self.conn()?;

        let parts = conn
            .query_row(
                "SELECT * FROM control_programs WHERE program = ?1",
                params![hex::encode(program.as_bytes())],
                |row| Self::row_to_program_parts(row),
            )
            .optional()
            .map_err(Self::db_error)?;

        parts.map(Self::decode_program).transpose()
    }

    fn list_control_programs_sync(
        &self,
        account_id: &str,
    ) -> Result<Vec<ControlProgram>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT * FROM control_programs WHERE account_id = ?1")
            .map_err(Self::db_error)?;

        let parts = stmt
            .query_map(params![account_id], |row| Self::row_to_program_parts(row))
            .map_err(Self::db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Self::db_error)?;

        let mut programs = parts
            .into_iter()
            .map(Self::decode_program)
            .collect::<Result<Vec<_>, _>>()?;
        programs.sort_by_key(|p| (p.branch, p.index));

        Ok(programs)
    }
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn insert_account(&self, account: &Account) -> StorageResult<()> {
        let account = account.clone();
        self.run_blocking(move |store| store.insert_account_sync(&account))
            .await
    }

    async fn get_account(&self, id: &str) -> StorageResult<Option<Account>> {
        let id = id.to_string();
        self.run_blocking(move |store| store.get_account_where_sync("id", &id))
            .await
    }

    async fn find_account_by_alias(&self, alias: &str) -> StorageResult<Option<Account>> {
        let alias = alias.to_string();
        self.run_blocking(move |store| store.get_account_where_sync("alias", &alias))
            .await
    }

    async fn compare_and_swap_next_index(
        &self,
        account_id: &str,
        branch: Branch,
        expected: u32,
        new: u32,
    ) -> StorageResult<bool> {
        let account_id = account_id.to_string();
        self.run_blocking(move |store| {
            store.compare_and_swap_sync(&account_id, branch, expected, new)
        })
        .await
    }

    async fn insert_control_program(&self, program: &ControlProgram) -> StorageResult<()> {
        let program = program.clone();
        self.run_blocking(move |store| store.insert_control_program_sync(&program))
            .await
    }

    async fn get_control_program(
        &self,
        program: &Script,
    ) -> StorageResult<Option<ControlProgram>> {
        let program = program.to_owned();
        self.run_blocking(move |store| store.get_control_program_sync(&program))
            .await
    }

    async fn list_control_programs(&self, account_id: &str) -> StorageResult<Vec<ControlProgram>> {
        let account_id = account_id.to_string();
        self.run_blocking(move |store| store.list_control_programs_sync(&account_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{test_account, test_program};

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = SqliteAccountStore::in_memory().unwrap();
        let account = test_account(Some("alice"));

        store.insert_account(&account).await.unwrap();

        let retrieved = store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(retrieved, account);

        let by_alias = store.find_account_by_alias("alice").await.unwrap().unwrap();
        assert_eq!(by_alias.id, account.id);
    }

    #[tokio::test]
    async fn test_duplicate_alias() {
        let store = SqliteAccountStore::in_memory().unwrap();

        store.insert_account(&test_account(Some("alice"))).await.unwrap();
        let result = store.insert_account(&test_account(Some("alice"))).await;

        assert!(matches!(result, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = SqliteAccountStore::in_memory().unwrap();
        let account = test_account(None);
        store.insert_account(&account).await.unwrap();

        assert!(store
            .compare_and_swap_next_index(&account.id, Branch::Change, 0, 1)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap_next_index(&account.id, Branch::Change, 0, 1)
            .await
            .unwrap());

        let stored = store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.next_index.get(Branch::Change), 1);
        assert_eq!(stored.next_index.get(Branch::External), 0);
    }

    #[tokio::test]
    async fn test_compare_and_swap_unknown_account() {
        let store = SqliteAccountStore::in_memory().unwrap();
        let result = store
            .compare_and_swap_next_index("missing", Branch::External, 0, 1)
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_program_slot_unique() {
        let store = SqliteAccountStore::in_memory().unwrap();
        let account = test_account(None);
        store.insert_account(&account).await.unwrap();

        let first = test_program(&account.id, Branch::External, 0, 0x01);
        let same_slot = test_program(&account.id, Branch::External, 0, 0x02);

        store.insert_control_program(&first).await.unwrap();
        let result = store.insert_control_program(&same_slot).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));

        let found = store
            .get_control_program(&first.program)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, first);
    }

    #[tokio::test]
    async fn test_counters_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        let account = test_account(Some("alice"));

        {
            let store = SqliteAccountStore::new(&path).unwrap();
            store.insert_account(&account).await.unwrap();
            store
                .compare_and_swap_next_index(&account.id, Branch::External, 0, 4)
                .await
                .unwrap();
        }

        let reopened = SqliteAccountStore::new(&path).unwrap();
        let stored = reopened.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.next_index.get(Branch::External), 4);
    }

    #[tokio::test]
    async fn test_locked_database_gives_up_at_busy_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        let store = SqliteAccountStore::new(&path)
            .unwrap()
            .with_busy_timeout(Duration::from_millis(50));
        let account = test_account(None);
        store.insert_account(&account).await.unwrap();

        let writer = rusqlite::Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();

        let started = std::time::Instant::now();
        let result = store
            .compare_and_swap_next_index(&account.id, Branch::External, 0, 1)
            .await;
        assert!(matches!(result, Err(StorageError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));

        writer.execute_batch("ROLLBACK").unwrap();
        let stored = store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.next_index.get(Branch::External), 0);
    }
}
