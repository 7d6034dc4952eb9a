#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{NewTurn, Session, SessionTurn, TurnStatus};

const SESSION_COLUMNS: &str = "session_id, agent_id, session_name, created_at, updated_at";
const TURN_COLUMNS: &str =
    "id, session_id, position, role, content, status, created_at, updated_at";

pub struct SessionQueries;

impl SessionQueries {
    #[inline]
    pub async fn create(
        pool: &SqlitePool,
        agent_id: &str,
        session_name: Option<&str>,
    ) -> Result<Session> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let session = sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO agent_sessions (session_id, agent_id, session_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(&session_id)
        .bind(agent_id)
        .bind(session_name)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .context("Failed to create session")?;

        Ok(session)
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, session_id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get session by id")?;

        Ok(session)
    }

    /// Sessions of one agent, most recently active first
    #[inline]
    pub async fn list_by_agent(pool: &SqlitePool, agent_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM agent_sessions
             WHERE agent_id = ?
             ORDER BY updated_at DESC, session_id"
        ))
        .bind(agent_id)
        .fetch_all(pool)
        .await
        .context("Failed to list sessions for agent")?;

        Ok(sessions)
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM agent_sessions ORDER BY updated_at DESC, session_id"
        ))
        .fetch_all(pool)
        .await
        .context("Failed to list sessions")?;

        Ok(sessions)
    }

    #[inline]
    pub async fn rename(pool: &SqlitePool, session_id: &str, session_name: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agent_sessions SET session_name = ?, updated_at = ? WHERE session_id = ?",
        )
        .bind(session_name)
        .bind(Utc::now().naive_utc())
        .bind(session_id)
        .execute(pool)
        .await
        .context("Failed to rename session")?;

        Ok(result.rows_affected() > 0)
    }

    #[inline]
    pub async fn touch(pool: &SqlitePool, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE agent_sessions SET updated_at = ? WHERE session_id = ?")
            .bind(Utc::now().naive_utc())
            .bind(session_id)
            .execute(pool)
            .await
            .context("Failed to update session timestamp")?;

        Ok(())
    }

    /// Delete a session and, through the foreign key cascade, its turns
    #[inline]
    pub async fn delete(pool: &SqlitePool, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM agent_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(pool)
            .await
            .context("Failed to delete session")?;

        Ok(result.rows_affected() > 0)
    }
}

pub struct TurnQueries;

impl TurnQueries {
    /// Append a turn at the next free position of its session.
    ///
    /// The position is computed inside the insert statement so concurrent
    /// appends to one session cannot collide.
    #[inline]
    pub async fn append(pool: &SqlitePool, turn: &NewTurn) -> Result<SessionTurn> {
        let now = Utc::now().naive_utc();

        let created = sqlx::query_as::<_, SessionTurn>(&format!(
            "INSERT INTO session_turns (session_id, position, role, content, status, created_at, updated_at)
             VALUES (
                 ?1,
                 (SELECT COALESCE(MAX(position), -1) + 1 FROM session_turns WHERE session_id = ?1),
                 ?2, ?3, ?4, ?5, ?5
             )
             RETURNING {TURN_COLUMNS}"
        ))
        .bind(&turn.session_id)
        .bind(turn.role)
        .bind(&turn.content)
        .bind(turn.status)
        .bind(now)
        .fetch_one(pool)
        .await
        .context("Failed to append session turn")?;

        SessionQueries::touch(pool, &turn.session_id).await?;

        Ok(created)
    }

    #[inline]
    pub async fn update(
        pool: &SqlitePool,
        turn_id: i64,
        content: &str,
        status: TurnStatus,
    ) -> Result<Option<SessionTurn>> {
        let updated = sqlx::query_as::<_, SessionTurn>(&format!(
            "UPDATE session_turns SET content = ?, status = ?, updated_at = ?
             WHERE id = ?
             RETURNING {TURN_COLUMNS}"
        ))
        .bind(content)
        .bind(status)
        .bind(Utc::now().naive_utc())
        .bind(turn_id)
        .fetch_optional(pool)
        .await
        .context("Failed to update session turn")?;

        Ok(updated)
    }

    #[inline]
    pub async fn list_by_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<SessionTurn>> {
        let turns = sqlx::query_as::<_, SessionTurn>(&format!(
            "SELECT {TURN_COLUMNS} FROM session_turns
             WHERE session_id = ?
             ORDER BY position ASC"
        ))
        .bind(session_id)
        .fetch_all(pool)
        .await
        .context("Failed to list session turns")?;

        Ok(turns)
    }

    #[inline]
    pub async fn count_by_session(pool: &SqlitePool, session_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM session_turns WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(pool)
                .await
                .context("Failed to count session turns")?;

        Ok(count)
    }

    /// Mark turns left in `streaming` by an interrupted process as cancelled
    #[inline]
    pub async fn cancel_streaming(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE session_turns SET status = ?, updated_at = ? WHERE status = ?",
        )
        .bind(TurnStatus::Cancelled)
        .bind(Utc::now().naive_utc())
        .bind(TurnStatus::Streaming)
        .execute(pool)
        .await
        .context("Failed to cancel interrupted turns")?;

        Ok(result.rows_affected())
    }
}
