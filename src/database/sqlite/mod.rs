use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::database::sqlite::models::{NewTurn, Session, SessionTurn, Transcript, TurnStatus};
use crate::database::sqlite::queries::{SessionQueries, TurnQueries};
use crate::{RagError, Result};

#[cfg(test)]
mod tests;

pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

/// Session store backed by SQLite
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

#[inline]
fn database_error(error: anyhow::Error) -> RagError {
    RagError::Database(format!("{error:#}"))
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")
            .map_err(database_error)?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")
            .map_err(database_error)?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    #[inline]
    pub async fn initialize_from_config_dir(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| {
                format!(
                    "Failed to create config directory: {}",
                    config_dir.display()
                )
            })
            .map_err(database_error)?;

        Self::new(config_dir.join("sessions.db")).await
    }

    // Session operations
    #[inline]
    pub async fn create_session(&self, agent_id: &str, name: Option<&str>) -> Result<Session> {
        let session = SessionQueries::create(&self.pool, agent_id, name)
            .await
            .map_err(database_error)?;
        debug!("Created session {} for agent {}", session.session_id, agent_id);
        Ok(session)
    }

    #[inline]
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        SessionQueries::get_by_id(&self.pool, session_id)
            .await
            .map_err(database_error)
    }

    /// Fetch a session, mapping absence to [`RagError::NotFound`]
    #[inline]
    pub async fn require_session(&self, session_id: &str) -> Result<Session> {
        self.get_session(session_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("session {session_id}")))
    }

    #[inline]
    pub async fn list_sessions(&self, agent_id: Option<&str>) -> Result<Vec<Session>> {
        match agent_id {
            Some(agent_id) => SessionQueries::list_by_agent(&self.pool, agent_id).await,
            None => SessionQueries::list_all(&self.pool).await,
        }
        .map_err(database_error)
    }

    #[inline]
    pub async fn rename_session(&self, session_id: &str, name: &str) -> Result<bool> {
        SessionQueries::rename(&self.pool, session_id, name)
            .await
            .map_err(database_error)
    }

    /// Delete a session and all of its turns. Returns false when it did not exist.
    #[inline]
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let deleted = SessionQueries::delete(&self.pool, session_id)
            .await
            .map_err(database_error)?;
        if deleted {
            info!("Deleted session {}", session_id);
        }
        Ok(deleted)
    }

    // Turn operations
    #[inline]
    pub async fn append_turn(&self, turn: &NewTurn) -> Result<SessionTurn> {
        TurnQueries::append(&self.pool, turn)
            .await
            .map_err(database_error)
    }

    #[inline]
    pub async fn update_turn(
        &self,
        turn_id: i64,
        content: &str,
        status: TurnStatus,
    ) -> Result<SessionTurn> {
        TurnQueries::update(&self.pool, turn_id, content, status)
            .await
            .map_err(database_error)?
            .ok_or_else(|| RagError::NotFound(format!("turn {turn_id}")))
    }

    #[inline]
    pub async fn transcript(&self, session_id: &str) -> Result<Transcript> {
        let session = self.require_session(session_id).await?;
        let turns = TurnQueries::list_by_session(&self.pool, session_id)
            .await
            .map_err(database_error)?;
        Ok(Transcript { session, turns })
    }

    /// Close out assistant turns that were still streaming when a previous
    /// process stopped
    #[inline]
    pub async fn recover_interrupted_turns(&self) -> Result<u64> {
        let recovered = TurnQueries::cancel_streaming(&self.pool)
            .await
            .map_err(database_error)?;
        if recovered > 0 {
            warn!("Marked {} interrupted turns as cancelled", recovered);
        }
        Ok(recovered)
    }
}
