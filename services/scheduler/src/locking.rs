//! Named scheduler locks.
//!
//! Each manager holds a cluster-wide named lock for the duration of one cycle.
//! Acquisition is non-blocking: a manager that loses the race exits immediately
//! instead of queuing, so at most one instance of each manager class runs at a
//! time without stalling callers.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Postgres, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::db::Database;

/// Lock names, one per manager class.
pub const TASK_MANAGER_LOCK: &str = "task_manager_lock";
pub const DEPENDENCY_MANAGER_LOCK: &str = "dependency_manager_lock";
pub const WORKFLOW_MANAGER_LOCK: &str = "workflow_manager_lock";

/// Lock operation errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Releasing a lock that is not held.
    #[error("lock '{0}' is not held")]
    NotHeld(String),
}

/// Cluster-wide named lock with non-blocking acquisition.
#[async_trait]
pub trait NamedLock: Send + Sync {
    /// Try to acquire the lock. Returns false immediately when another holder
    /// exists.
    async fn try_acquire(&self, name: &str) -> Result<bool, LockError>;

    /// Release a previously acquired lock.
    async fn release(&self, name: &str) -> Result<(), LockError>;
}

/// Postgres advisory-lock implementation.
///
/// Advisory locks are session-scoped, so each held lock pins a dedicated pool
/// connection until release.
pub struct PgAdvisoryLock {
    db: Database,
    held: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl PgAdvisoryLock {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl NamedLock for PgAdvisoryLock {
    async fn try_acquire(&self, name: &str) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        if held.contains_key(name) {
            return Ok(false);
        }

        let mut conn = self.db.pool().acquire().await?;
        let row = sqlx::query("SELECT pg_try_advisory_lock(hashtext($1)) AS acquired")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
        let acquired: bool = row.get("acquired");

        if acquired {
            held.insert(name.to_string(), conn);
        }
        Ok(acquired)
    }

    async fn release(&self, name: &str) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        let mut conn = held
            .remove(name)
            .ok_or_else(|| LockError::NotHeld(name.to_string()))?;

        let result = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(name)
            .execute(&mut *conn)
            .await;

        // The session owns the lock, so a connection that failed to unlock must
        // not go back to the pool.
        if let Err(e) = result {
            debug!(lock = name, error = %e, "Unlock query failed, closing connection");
            let _ = conn.detach().close().await;
        }
        Ok(())
    }
}

/// In-process lock for tests and single-node deployments.
#[derive(Default)]
pub struct LocalLock {
    held: Mutex<HashSet<String>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NamedLock for LocalLock {
    async fn try_acquire(&self, name: &str) -> Result<bool, LockError> {
        Ok(self.held.lock().await.insert(name.to_string()))
    }

    async fn release(&self, name: &str) -> Result<(), LockError> {
        if self.held.lock().await.remove(name) {
            Ok(())
        } else {
            Err(LockError::NotHeld(name.to_string()))
        }
    }
}
