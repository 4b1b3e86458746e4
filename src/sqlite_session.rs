//! # SQLite-Based Session Storage
//!
//! [`SqliteSessionStore`] persists whole [`Session`]s so a conversation can
//! resume across process restarts. Each session is stored as one JSON row,
//! replaced inside a transaction on every save. A reader therefore sees
//! either the previous completed turn or the next one, never a half-written
//! tool exchange.
//!
//! ```rust,no_run
//! use agent_orchestrator::session::{Session, SessionStore};
//! use agent_orchestrator::sqlite_session::SqliteSessionStore;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteSessionStore::new("chat.db").await?;
//!
//! let mut session = Session::new("user_123");
//! session.push_user("Hello, persistent world!");
//! store.save(&session).await?;
//!
//! let loaded = store.load(session.id()).await?.expect("saved above");
//! assert_eq!(loaded.turns().len(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use crate::error::StoreError;
use crate::session::{Session, SessionId, SessionStore};

/// A [`SessionStore`] backed by a SQLite database.
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    /// Opens (creating if missing) the database at `db_path` and runs
    /// migrations.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}", db_path.as_ref().display());
        let options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory store, useful for testing.
    ///
    /// The pool is limited to a single connection; every connection to
    /// `sqlite::memory:` would otherwise see its own empty database.
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                owner TEXT,
                turn_counter INTEGER NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Identifiers of every stored session, most recently updated first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let rows = sqlx::query("SELECT session_id FROM sessions ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| SessionId(row.get::<String, _>("session_id")))
            .collect())
    }

    /// Removes a session; returns whether a row existed.
    pub async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT data FROM sessions WHERE session_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: String = row.get("data");
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let data = serde_json::to_string(session)?;
        let mut tx = self.pool.begin().await?;

        // Stale writers must not roll a session back.
        let stored: Option<i64> =
            sqlx::query_scalar("SELECT turn_counter FROM sessions WHERE session_id = ?")
                .bind(session.id().as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(stored) = stored {
            if stored > session.turn_counter() as i64 {
                return Err(StoreError::Other(format!(
                    "session '{}' is at turn {} but save carries turn {}",
                    session.id(),
                    stored,
                    session.turn_counter()
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, owner, turn_counter, data, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                owner = excluded.owner,
                turn_counter = excluded.turn_counter,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session.id().as_str())
        .bind(session.owner())
        .bind(session.turn_counter() as i64)
        .bind(data)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish_non_exhaustive()
    }
}
