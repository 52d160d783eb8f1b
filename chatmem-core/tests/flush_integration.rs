//! Flush protocol tests against the in-memory client.
//!
//! These tests verify:
//! 1. Local mutations never reach the service before `flush`
//! 2. `flush` with nothing pending is a no-op
//! 3. Partial failure is reported distinctly and only the remainder is retried

mod common;

use std::sync::Arc;

use chatmem_core::{MemoryError, Message, SessionEntry, SessionRepo, ToolCall, User, ZepAdapter};
use common::InMemoryClient;
use serde_json::{json, Value};

async fn setup() -> (Arc<InMemoryClient>, SessionRepo, chatmem_core::Session) {
    let client = Arc::new(InMemoryClient::new());
    let repo = SessionRepo::new(client.clone());
    repo.add_user(User::new("john_doe")).await.unwrap();
    let session = repo
        .new_session("john_doe", Some("Getting Started"), None)
        .await
        .unwrap();
    (client, repo, session)
}

#[tokio::test]
async fn test_mutations_stay_local_until_flush() {
    let (client, repo, mut session) = setup().await;

    session.add_message(Message::new("user", "Hello, Agent C!"));
    session.add_message(Message::new("assistant", "Hello! How can I help you today?"));
    session.set_meta("topic", json!("Introduction"));
    session.set_managed_meta("application", "language", "en-US");

    assert_eq!(InMemoryClient::calls(&client.append_calls), 0);
    assert_eq!(InMemoryClient::calls(&client.metadata_writes), 0);
    assert!(client.stored_messages(&session.session_id).is_empty());

    let report = repo.flush(&mut session).await.unwrap();
    assert_eq!(report.entries_written, 2);
    assert!(report.metadata_written);
    assert!(!session.has_pending_changes());

    let reloaded = repo
        .get_user_session("john_doe", &session.session_id)
        .await
        .unwrap();
    let messages = reloaded.get_messages(10, None);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[0].content, "Hello, Agent C!");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(messages[1].content, "Hello! How can I help you today?");
    assert_eq!(reloaded.get_meta("topic", Value::Null), json!("Introduction"));
    assert_eq!(
        reloaded.get_managed_meta("application", "language", None),
        Some("en-US")
    );
    assert_eq!(reloaded.title.as_deref(), Some("Getting Started"));
}

#[tokio::test]
async fn test_flush_without_changes_is_noop() {
    let (client, repo, mut session) = setup().await;

    let report = repo.flush(&mut session).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(InMemoryClient::calls(&client.append_calls), 0);
    assert_eq!(InMemoryClient::calls(&client.metadata_writes), 0);

    session.add_message(Message::user("once"));
    repo.flush(&mut session).await.unwrap();
    let report = repo.flush(&mut session).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(InMemoryClient::calls(&client.append_calls), 1);
}

#[tokio::test]
async fn test_flush_preserves_interleaved_order_and_tool_calls() {
    let (client, repo, mut session) = setup().await;
    let call = ToolCall::new("search", json!({"q": "rust"}).as_object().cloned().unwrap())
        .with_result(json!(["a", "b"]));

    session.add_message(Message::user("find rust"));
    session.add_tool_call(call.clone());
    session.add_interaction(vec![Message::assistant("found a"), Message::assistant("and b")]);
    repo.flush(&mut session).await.unwrap();

    let stored = client.stored_messages(&session.session_id);
    let role_types: Vec<_> = stored.iter().filter_map(|m| m.role_type.as_deref()).collect();
    assert_eq!(role_types, vec!["user", "tool", "assistant", "assistant"]);

    let history = repo
        .get_session_messages("john_doe", &session.session_id, 10, None)
        .await
        .unwrap();
    assert_eq!(history[1], SessionEntry::ToolCall(call));
}

#[tokio::test]
async fn test_partial_flush_reports_and_retries_only_metadata() {
    let (client, repo, mut session) = setup().await;
    session.add_message(Message::user("hi"));
    session.set_meta("topic", json!("greeting"));

    *client.fail_metadata_writes.lock().unwrap() = true;
    let err = repo.flush(&mut session).await.unwrap_err();
    match err {
        MemoryError::PartialFlush {
            entries_written,
            source,
        } => {
            assert_eq!(entries_written, 1);
            assert!(matches!(*source, MemoryError::Api { code: 503, .. }));
        }
        other => panic!("Expected PartialFlush, got {other:?}"),
    }
    assert!(session.pending_entries().is_empty());
    assert!(session.has_pending_changes(), "metadata should still be pending");

    *client.fail_metadata_writes.lock().unwrap() = false;
    let report = repo.flush(&mut session).await.unwrap();
    assert_eq!(report.entries_written, 0);
    assert!(report.metadata_written);
    assert_eq!(InMemoryClient::calls(&client.append_calls), 1);
    assert_eq!(client.stored_messages(&session.session_id).len(), 1);
}

#[tokio::test]
async fn test_total_failure_keeps_everything_pending() {
    let (client, repo, mut session) = setup().await;
    session.add_message(Message::user("hi"));
    session.set_meta("topic", json!("greeting"));

    *client.fail_appends.lock().unwrap() = true;
    let err = repo.flush(&mut session).await.unwrap_err();
    assert!(matches!(err, MemoryError::Api { code: 500, .. }));
    assert_eq!(session.pending_entries().len(), 1);
    assert_eq!(InMemoryClient::calls(&client.metadata_writes), 0);

    *client.fail_appends.lock().unwrap() = false;
    let report = repo.flush(&mut session).await.unwrap();
    assert_eq!(report.entries_written, 1);
    assert!(report.metadata_written);
}

#[tokio::test]
async fn test_metadata_only_failure_is_not_partial() {
    let (client, repo, mut session) = setup().await;
    session.set_managed_meta("tool", "search.depth", "3");

    *client.fail_metadata_writes.lock().unwrap() = true;
    let err = repo.flush(&mut session).await.unwrap_err();
    assert!(matches!(err, MemoryError::Api { code: 503, .. }));
}

#[tokio::test]
async fn test_session_flush_with_explicit_client_and_adapter() {
    let (client, _repo, mut session) = setup().await;
    session.add_message(Message::system("be brief"));

    let report = session.flush(client.as_ref(), &ZepAdapter).await.unwrap();
    assert_eq!(report.entries_written, 1);
    assert_eq!(client.stored_messages(&session.session_id).len(), 1);
}

#[tokio::test]
async fn test_malformed_remote_history_is_a_format_error() {
    let (client, repo, session) = setup().await;
    client.push_raw_message(
        &session.session_id,
        chatmem_core::ExternalMessage {
            uuid: Some("x".into()),
            content: Some("no discriminant".into()),
            created_at: Some("2024-07-01T12:00:00Z".into()),
            ..Default::default()
        },
    );

    let err = repo
        .get_user_session("john_doe", &session.session_id)
        .await
        .unwrap_err();
    match err {
        MemoryError::Format(e) => assert_eq!(e.index, 0),
        other => panic!("Expected FormatError, got {other:?}"),
    }
}
