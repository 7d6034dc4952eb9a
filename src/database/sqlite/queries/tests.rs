use super::*;
use crate::database::sqlite::models::TurnRole;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

async fn create_test_pool() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true)
                .foreign_keys(true),
        )
        .await
        .expect("Failed to create test pool");

    sqlx::raw_sql(include_str!("../migrations/001_initial_schema.sql"))
        .execute(&pool)
        .await
        .expect("Failed to run migrations");

    (temp_dir, pool)
}

#[tokio::test]
async fn session_crud_operations() {
    let (_temp_dir, pool) = create_test_pool().await;

    let created = SessionQueries::create(&pool, "rag-agent", Some("First chat"))
        .await
        .expect("Failed to create session");
    assert_eq!(created.agent_id, "rag-agent");
    assert_eq!(created.session_name.as_deref(), Some("First chat"));
    assert!(Uuid::parse_str(&created.session_id).is_ok());

    let retrieved = SessionQueries::get_by_id(&pool, &created.session_id)
        .await
        .expect("Failed to get session")
        .expect("Session should exist");
    assert_eq!(retrieved, created);

    assert!(
        SessionQueries::rename(&pool, &created.session_id, "Renamed")
            .await
            .expect("Failed to rename session")
    );
    let renamed = SessionQueries::get_by_id(&pool, &created.session_id)
        .await
        .expect("Failed to get session")
        .expect("Session should exist");
    assert_eq!(renamed.session_name.as_deref(), Some("Renamed"));

    assert!(
        SessionQueries::delete(&pool, &created.session_id)
            .await
            .expect("Failed to delete session")
    );
    assert!(
        SessionQueries::get_by_id(&pool, &created.session_id)
            .await
            .expect("Failed to get session")
            .is_none()
    );
    assert!(
        !SessionQueries::delete(&pool, &created.session_id)
            .await
            .expect("Failed to delete session")
    );
}

#[tokio::test]
async fn sessions_are_listed_per_agent() {
    let (_temp_dir, pool) = create_test_pool().await;

    for _ in 0..3 {
        SessionQueries::create(&pool, "rag-agent", None)
            .await
            .expect("Failed to create session");
    }
    SessionQueries::create(&pool, "other-agent", None)
        .await
        .expect("Failed to create session");

    let rag = SessionQueries::list_by_agent(&pool, "rag-agent")
        .await
        .expect("Failed to list sessions");
    assert_eq!(rag.len(), 3);
    assert!(rag.iter().all(|s| s.agent_id == "rag-agent"));

    let all = SessionQueries::list_all(&pool)
        .await
        .expect("Failed to list sessions");
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn turns_get_consecutive_positions() {
    let (_temp_dir, pool) = create_test_pool().await;
    let session = SessionQueries::create(&pool, "rag-agent", None)
        .await
        .expect("Failed to create session");
    let other = SessionQueries::create(&pool, "rag-agent", None)
        .await
        .expect("Failed to create session");

    let first = TurnQueries::append(&pool, &NewTurn::user(&session.session_id, "hello"))
        .await
        .expect("Failed to append turn");
    let second = TurnQueries::append(&pool, &NewTurn::streaming_assistant(&session.session_id))
        .await
        .expect("Failed to append turn");
    let elsewhere = TurnQueries::append(&pool, &NewTurn::user(&other.session_id, "hi"))
        .await
        .expect("Failed to append turn");

    assert_eq!(first.position, 0);
    assert_eq!(second.position, 1);
    assert_eq!(elsewhere.position, 0);
    assert_eq!(second.role, TurnRole::Assistant);
    assert_eq!(second.status, TurnStatus::Streaming);

    let count = TurnQueries::count_by_session(&pool, &session.session_id)
        .await
        .expect("Failed to count turns");
    assert_eq!(count, 2);
}

#[tokio::test]
async fn update_turn_records_final_state() {
    let (_temp_dir, pool) = create_test_pool().await;
    let session = SessionQueries::create(&pool, "rag-agent", None)
        .await
        .expect("Failed to create session");
    let turn = TurnQueries::append(&pool, &NewTurn::streaming_assistant(&session.session_id))
        .await
        .expect("Failed to append turn");

    let updated = TurnQueries::update(&pool, turn.id, "The answer", TurnStatus::Complete)
        .await
        .expect("Failed to update turn")
        .expect("Turn should exist");
    assert_eq!(updated.content, "The answer");
    assert_eq!(updated.status, TurnStatus::Complete);
    assert_eq!(updated.position, turn.position);

    let missing = TurnQueries::update(&pool, 9999, "x", TurnStatus::Failed)
        .await
        .expect("Failed to update turn");
    assert!(missing.is_none());
}

#[tokio::test]
async fn transcript_is_ordered_by_position() {
    let (_temp_dir, pool) = create_test_pool().await;
    let session = SessionQueries::create(&pool, "rag-agent", None)
        .await
        .expect("Failed to create session");

    for content in ["one", "two", "three", "four"] {
        TurnQueries::append(&pool, &NewTurn::user(&session.session_id, content))
            .await
            .expect("Failed to append turn");
    }

    let turns = TurnQueries::list_by_session(&pool, &session.session_id)
        .await
        .expect("Failed to list turns");
    let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["one", "two", "three", "four"]);
    let positions: Vec<i64> = turns.iter().map(|t| t.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn deleting_session_cascades_to_turns() {
    let (_temp_dir, pool) = create_test_pool().await;
    let session = SessionQueries::create(&pool, "rag-agent", None)
        .await
        .expect("Failed to create session");
    TurnQueries::append(&pool, &NewTurn::user(&session.session_id, "hello"))
        .await
        .expect("Failed to append turn");

    SessionQueries::delete(&pool, &session.session_id)
        .await
        .expect("Failed to delete session");

    let count = TurnQueries::count_by_session(&pool, &session.session_id)
        .await
        .expect("Failed to count turns");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn append_to_missing_session_fails() {
    let (_temp_dir, pool) = create_test_pool().await;

    let result = TurnQueries::append(&pool, &NewTurn::user("no-such-session", "hello")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn interrupted_turns_are_cancelled() {
    let (_temp_dir, pool) = create_test_pool().await;
    let session = SessionQueries::create(&pool, "rag-agent", None)
        .await
        .expect("Failed to create session");
    TurnQueries::append(&pool, &NewTurn::user(&session.session_id, "hello"))
        .await
        .expect("Failed to append turn");
    let streaming = TurnQueries::append(&pool, &NewTurn::streaming_assistant(&session.session_id))
        .await
        .expect("Failed to append turn");

    let cancelled = TurnQueries::cancel_streaming(&pool)
        .await
        .expect("Failed to cancel turns");
    assert_eq!(cancelled, 1);

    let turns = TurnQueries::list_by_session(&pool, &session.session_id)
        .await
        .expect("Failed to list turns");
    assert_eq!(turns[0].status, TurnStatus::Complete);
    assert_eq!(turns[1].id, streaming.id);
    assert_eq!(turns[1].status, TurnStatus::Cancelled);
}
