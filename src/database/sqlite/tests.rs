use super::*;
use crate::database::sqlite::models::TurnRole;
use tempfile::TempDir;

async fn create_test_database() -> (TempDir, Database) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let database = Database::initialize_from_config_dir(temp_dir.path())
        .await
        .expect("Failed to create database");
    (temp_dir, database)
}

#[tokio::test]
async fn initialize_creates_database_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_dir = temp_dir.path().join("nested").join("config");

    let database = Database::initialize_from_config_dir(&config_dir)
        .await
        .expect("Failed to create database");

    assert!(config_dir.join("sessions.db").exists());
    database
        .run_migrations()
        .await
        .expect("Migrations should be re-runnable");
}

#[tokio::test]
async fn session_lifecycle() {
    let (_temp_dir, database) = create_test_database().await;

    let session = database
        .create_session("rag-agent", None)
        .await
        .expect("Failed to create session");

    let user = database
        .append_turn(&NewTurn::user(&session.session_id, "What is the methodology?"))
        .await
        .expect("Failed to append user turn");
    let assistant = database
        .append_turn(&NewTurn::streaming_assistant(&session.session_id))
        .await
        .expect("Failed to append assistant turn");
    database
        .update_turn(assistant.id, "A survey [page 4]", TurnStatus::Complete)
        .await
        .expect("Failed to update turn");

    let transcript = database
        .transcript(&session.session_id)
        .await
        .expect("Failed to load transcript");
    assert_eq!(transcript.session.session_id, session.session_id);
    assert_eq!(transcript.turns.len(), 2);
    assert_eq!(transcript.turns[0].id, user.id);
    assert_eq!(transcript.turns[1].role, TurnRole::Assistant);
    assert_eq!(transcript.turns[1].content, "A survey [page 4]");
    assert_eq!(transcript.history().len(), 2);

    assert!(
        database
            .delete_session(&session.session_id)
            .await
            .expect("Failed to delete session")
    );
    assert!(matches!(
        database.transcript(&session.session_id).await,
        Err(RagError::NotFound(_))
    ));
}

#[tokio::test]
async fn sessions_survive_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let session_id = {
        let database = Database::initialize_from_config_dir(temp_dir.path())
            .await
            .expect("Failed to create database");
        let session = database
            .create_session("rag-agent", Some("persisted"))
            .await
            .expect("Failed to create session");
        database
            .append_turn(&NewTurn::user(&session.session_id, "hello"))
            .await
            .expect("Failed to append turn");
        database.pool().close().await;
        session.session_id
    };

    let reopened = Database::initialize_from_config_dir(temp_dir.path())
        .await
        .expect("Failed to reopen database");
    let transcript = reopened
        .transcript(&session_id)
        .await
        .expect("Failed to load transcript");
    assert_eq!(transcript.session.session_name.as_deref(), Some("persisted"));
    assert_eq!(transcript.turns.len(), 1);
}

#[tokio::test]
async fn list_sessions_filters_by_agent() {
    let (_temp_dir, database) = create_test_database().await;
    database
        .create_session("rag-agent", None)
        .await
        .expect("Failed to create session");
    database
        .create_session("other", None)
        .await
        .expect("Failed to create session");

    let filtered = database
        .list_sessions(Some("rag-agent"))
        .await
        .expect("Failed to list sessions");
    assert_eq!(filtered.len(), 1);

    let all = database
        .list_sessions(None)
        .await
        .expect("Failed to list sessions");
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn update_missing_turn_is_not_found() {
    let (_temp_dir, database) = create_test_database().await;

    let result = database.update_turn(42, "x", TurnStatus::Complete).await;
    assert!(matches!(result, Err(RagError::NotFound(_))));
}

#[tokio::test]
async fn recover_interrupted_turns_on_startup() {
    let (_temp_dir, database) = create_test_database().await;
    let session = database
        .create_session("rag-agent", None)
        .await
        .expect("Failed to create session");
    database
        .append_turn(&NewTurn::streaming_assistant(&session.session_id))
        .await
        .expect("Failed to append turn");

    assert_eq!(
        database
            .recover_interrupted_turns()
            .await
            .expect("Failed to recover turns"),
        1
    );
    assert_eq!(
        database
            .recover_interrupted_turns()
            .await
            .expect("Failed to recover turns"),
        0
    );
}
