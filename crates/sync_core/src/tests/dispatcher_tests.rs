use shared::domain::{DeliveryStatus, MessageKind, SessionId, UserId};
use shared::error::SyncError;
use shared::model::{ChatMessage, SessionRecord};
use store::DocumentStore;

use crate::support::{settle, wait_for_event, Fixture};
use crate::{
    AttachOptions, CreateMode, EngineConfig, MediaPayload, MessageDraft, MessageUpdate,
    SendOptions, SessionRequest, SyncEvent,
};

fn direct(peer: &str) -> SessionRequest {
    SessionRequest::Direct {
        peer: UserId::new(peer),
    }
}

fn image_draft() -> MessageDraft {
    MessageDraft {
        kind: MessageKind::Image,
        content: String::new(),
        reply_to: None,
        extra: None,
    }
}

fn media(name: &str) -> MediaPayload {
    MediaPayload {
        name: name.to_owned(),
        bytes: vec![1, 2, 3],
    }
}

async fn session_record(fx: &Fixture, id: &str) -> SessionRecord {
    fx.store
        .get("sessions", id)
        .await
        .expect("get")
        .expect("record")
        .decode()
        .expect("decode")
}

async fn stored_message(fx: &Fixture, session: &SessionId, id: &str) -> Option<ChatMessage> {
    let path = format!("sessions/{session}/messages");
    fx.store
        .get(&path, id)
        .await
        .expect("get")
        .map(|doc| doc.decode().expect("decode"))
}

#[tokio::test]
async fn first_send_creates_the_session_before_the_message() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let sent = fx
        .engine
        .send(MessageDraft::text("hello"), SendOptions::default())
        .await
        .expect("send");

    let writes = fx.recording.recorded_writes().await;
    let session_write = writes
        .iter()
        .position(|entry| entry.starts_with("write sessions/") && !entry.contains("/messages/"))
        .expect("session write");
    let message_write = writes
        .iter()
        .position(|entry| entry.contains("/messages/"))
        .expect("message write");
    assert!(session_write < message_write);

    let stored = stored_message(&fx, &sent.session_id, sent.id.as_str())
        .await
        .expect("stored message");
    assert_eq!(stored, sent);
    let record = session_record(&fx, sent.session_id.as_str()).await;
    assert_eq!(
        record.last_message.expect("last message").message_id,
        sent.id
    );
}

#[tokio::test]
async fn pending_direct_send_adopts_a_room_created_meanwhile() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");

    let bob = fx.sharing("bob");
    bob.engine
        .resolve_session(direct("alice"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let first = bob
        .engine
        .send(MessageDraft::text("first"), SendOptions::default())
        .await
        .expect("send");

    settle().await;
    let second = fx
        .engine
        .send(MessageDraft::text("second"), SendOptions::default())
        .await
        .expect("send");

    assert_eq!(second.session_id, first.session_id);
    let active = fx.engine.active_session().await.expect("active session");
    assert_eq!(active.session_id, first.session_id);
    assert!(active.is_materialized());
    assert_eq!(fx.store.document_count("sessions").await, 1);
    let messages_path = format!("sessions/{}/messages", first.session_id);
    assert_eq!(fx.store.document_count(&messages_path).await, 2);
}

#[tokio::test]
async fn failed_first_send_keeps_the_session_and_flags_the_echo() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let mut events = fx.engine.events();
    fx.recording.fail_writes_to("/messages").await;

    let err = fx
        .engine
        .send(MessageDraft::text("hello"), SendOptions::default())
        .await
        .err()
        .expect("send fails");
    match err {
        SyncError::PartialFailure { completed, .. } => {
            assert!(completed.contains("session created"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The session survived the failed message write.
    assert_eq!(fx.store.document_count("sessions").await, 1);
    let active = fx.engine.active_session().await.expect("active session");
    assert!(active.is_materialized());

    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::SendFailed { .. })
    })
    .await;
    let view = fx.engine.session_view().await.expect("view");
    assert_eq!(view.undelivered.len(), 1);
    assert_eq!(view.messages.len(), 1);
}

#[tokio::test]
async fn undelivered_echoes_survive_replacement_and_clear_on_retry() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    fx.engine
        .send(MessageDraft::text("one"), SendOptions::default())
        .await
        .expect("send");
    let handle = fx.engine.active_session().await.expect("active session");

    let mut events = fx.engine.events();
    fx.engine
        .attach(&handle, AttachOptions::default())
        .await
        .expect("attach");

    fx.recording.fail_writes_to("/messages").await;
    let err = fx
        .engine
        .send(MessageDraft::text("two"), SendOptions::default())
        .await
        .err()
        .expect("send fails");
    assert!(err.is_retryable());
    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::SendFailed { .. })
    })
    .await;

    let bob = fx.sharing("bob");
    bob.engine
        .resolve_session(direct("alice"), CreateMode::Lazy)
        .await
        .expect("resolve");
    settle().await;
    bob.engine
        .send(MessageDraft::text("three"), SendOptions::default())
        .await
        .expect("send");

    // The wholesale replacement keeps the undelivered echo visible.
    wait_for_event(&mut events, |event| {
        matches!(event, SyncEvent::MessagesReplaced { messages, .. }
            if messages.len() == 3 && messages.iter().any(|m| m.content == "two"))
    })
    .await;

    let echo = fx.engine.session_view().await.expect("view").undelivered[0].clone();
    fx.recording.clear_failures().await;
    fx.engine
        .send_raw(echo.clone(), SendOptions::default())
        .await
        .expect("retry");
    let view = fx.engine.session_view().await.expect("view");
    assert!(view.undelivered.is_empty());
    assert!(
        stored_message(&fx, &echo.session_id, echo.id.as_str())
            .await
            .is_some()
    );
}

#[tokio::test]
async fn sends_retry_transient_write_failures() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    fx.engine
        .send(MessageDraft::text("one"), SendOptions::default())
        .await
        .expect("send");

    fx.recording.fail_next_writes(2);
    let sent = fx
        .engine
        .send(
            MessageDraft::text("two"),
            SendOptions {
                retry_limit: 2,
                media: None,
            },
        )
        .await
        .expect("send with retries");
    assert!(
        stored_message(&fx, &sent.session_id, sent.id.as_str())
            .await
            .is_some()
    );
}

#[tokio::test]
async fn media_uploads_replace_content_with_the_blob_url() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let sent = fx
        .engine
        .send(
            image_draft(),
            SendOptions {
                retry_limit: 0,
                media: Some(media("pic.png")),
            },
        )
        .await
        .expect("send media");

    assert!(sent.content.starts_with("mem://media/"));
    assert!(fx.blobs.contains(&sent.content).await);
    let stored = stored_message(&fx, &sent.session_id, sent.id.as_str())
        .await
        .expect("stored message");
    assert_eq!(stored.content, sent.content);
}

#[tokio::test]
async fn required_blob_kinds_keep_the_message_when_the_blob_delete_fails() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let sent = fx
        .engine
        .send(
            image_draft(),
            SendOptions {
                retry_limit: 0,
                media: Some(media("pic.png")),
            },
        )
        .await
        .expect("send media");

    fx.blobs.fail_deletes(true);
    let err = fx
        .engine
        .delete_message(&sent)
        .await
        .err()
        .expect("delete fails");
    assert!(matches!(err, SyncError::OperationFailed { .. }));
    assert!(
        stored_message(&fx, &sent.session_id, sent.id.as_str())
            .await
            .is_some()
    );
    assert!(fx.blobs.contains(&sent.content).await);

    fx.blobs.fail_deletes(false);
    fx.engine.delete_message(&sent).await.expect("delete");
    assert!(
        stored_message(&fx, &sent.session_id, sent.id.as_str())
            .await
            .is_none()
    );
    assert!(!fx.blobs.contains(&sent.content).await);
}

#[tokio::test]
async fn optional_blob_kinds_remove_the_message_despite_a_blob_failure() {
    let mut config = EngineConfig::new("alice");
    config.blob_required_for.clear();
    let fx = Fixture::with_config(config);
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let sent = fx
        .engine
        .send(
            image_draft(),
            SendOptions {
                retry_limit: 0,
                media: Some(media("pic.png")),
            },
        )
        .await
        .expect("send media");

    fx.blobs.fail_deletes(true);
    let err = fx
        .engine
        .delete_message(&sent)
        .await
        .err()
        .expect("delete reports the leftover blob");
    match err {
        SyncError::PartialFailure { completed, .. } => {
            assert!(completed.contains("message removed"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(
        stored_message(&fx, &sent.session_id, sent.id.as_str())
            .await
            .is_none()
    );
    assert!(fx.blobs.contains(&sent.content).await);
}

#[tokio::test]
async fn deleting_the_latest_message_rewinds_the_pointer() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let one = fx
        .engine
        .send(MessageDraft::text("one"), SendOptions::default())
        .await
        .expect("send");
    settle().await;
    let two = fx
        .engine
        .send(MessageDraft::text("two"), SendOptions::default())
        .await
        .expect("send");

    fx.engine.delete_message(&two).await.expect("delete two");
    let record = session_record(&fx, one.session_id.as_str()).await;
    assert_eq!(record.last_message.expect("pointer").message_id, one.id);

    fx.engine.delete_message(&one).await.expect("delete one");
    let record = session_record(&fx, one.session_id.as_str()).await;
    assert!(record.last_message.is_none());
}

#[tokio::test]
async fn deleting_an_older_message_keeps_the_pointer() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let one = fx
        .engine
        .send(MessageDraft::text("one"), SendOptions::default())
        .await
        .expect("send");
    settle().await;
    let two = fx
        .engine
        .send(MessageDraft::text("two"), SendOptions::default())
        .await
        .expect("send");

    fx.engine.delete_message(&one).await.expect("delete one");
    let record = session_record(&fx, two.session_id.as_str()).await;
    assert_eq!(record.last_message.expect("pointer").message_id, two.id);
    assert!(
        stored_message(&fx, &two.session_id, two.id.as_str())
            .await
            .is_some()
    );
}

#[tokio::test]
async fn reactions_merge_per_user_and_clear_on_none() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let sent = fx
        .engine
        .send(MessageDraft::text("hi"), SendOptions::default())
        .await
        .expect("send");

    fx.engine
        .react(&sent, Some("+1".into()))
        .await
        .expect("alice reacts");
    let bob = fx.sharing("bob");
    bob.engine
        .react(&sent, Some("tada".into()))
        .await
        .expect("bob reacts");

    let stored = stored_message(&fx, &sent.session_id, sent.id.as_str())
        .await
        .expect("stored message");
    assert_eq!(
        stored.reactions.get(&UserId::new("alice")).map(String::as_str),
        Some("+1")
    );
    assert_eq!(
        stored.reactions.get(&UserId::new("bob")).map(String::as_str),
        Some("tada")
    );

    fx.engine.react(&sent, None).await.expect("alice clears");
    let stored = stored_message(&fx, &sent.session_id, sent.id.as_str())
        .await
        .expect("stored message");
    assert!(!stored.reactions.contains_key(&UserId::new("alice")));
    assert_eq!(
        stored.reactions.get(&UserId::new("bob")).map(String::as_str),
        Some("tada")
    );
}

#[tokio::test]
async fn status_updates_touch_only_the_status_field() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let sent = fx
        .engine
        .send(MessageDraft::text("hi"), SendOptions::default())
        .await
        .expect("send");
    fx.engine
        .react(&sent, Some("+1".into()))
        .await
        .expect("react");

    let bob = fx.sharing("bob");
    bob.engine
        .update_status(&sent, DeliveryStatus::Read)
        .await
        .expect("mark read");

    let stored = stored_message(&fx, &sent.session_id, sent.id.as_str())
        .await
        .expect("stored message");
    assert_eq!(stored.status, DeliveryStatus::Read);
    assert_eq!(stored.content, "hi");
    assert!(stored.reactions.contains_key(&UserId::new("alice")));
}

#[tokio::test]
async fn empty_updates_are_skipped() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let sent = fx
        .engine
        .send(MessageDraft::text("hi"), SendOptions::default())
        .await
        .expect("send");

    let before = fx.recording.recorded_writes().await.len();
    fx.engine
        .update_message(&sent, MessageUpdate::default())
        .await
        .expect("empty update");
    assert_eq!(fx.recording.recorded_writes().await.len(), before);
}

#[tokio::test]
async fn sends_are_validated_before_any_side_effect() {
    let fx = Fixture::new("alice");
    let no_session = fx
        .engine
        .send(MessageDraft::text("hi"), SendOptions::default())
        .await;
    assert!(matches!(no_session, Err(SyncError::InvalidArgument(_))));

    let empty = fx
        .engine
        .send(MessageDraft::text(""), SendOptions::default())
        .await;
    assert!(matches!(empty, Err(SyncError::InvalidArgument(_))));

    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    let sent = fx
        .engine
        .send(MessageDraft::text("one"), SendOptions::default())
        .await
        .expect("send");
    let mut foreign = sent.clone();
    foreign.session_id = SessionId::new("elsewhere");
    let mismatched = fx.engine.send_raw(foreign, SendOptions::default()).await;
    assert!(matches!(mismatched, Err(SyncError::InvalidArgument(_))));
}

#[tokio::test]
async fn deleting_a_pending_echo_is_local_only() {
    let fx = Fixture::new("alice");
    fx.engine
        .resolve_session(direct("bob"), CreateMode::Lazy)
        .await
        .expect("resolve");
    fx.recording.fail_writes_to("sessions").await;
    let err = fx
        .engine
        .send(MessageDraft::text("hello"), SendOptions::default())
        .await
        .err()
        .expect("send fails before creation");
    assert!(err.is_retryable());
    let active = fx.engine.active_session().await.expect("active session");
    assert!(!active.is_materialized());

    let echo = fx.engine.session_view().await.expect("view").undelivered[0].clone();
    fx.recording.clear_failures().await;
    fx.engine.delete_message(&echo).await.expect("delete echo");
    assert!(fx.engine.local_messages().await.is_empty());
    let writes = fx.recording.recorded_writes().await;
    assert!(writes.iter().all(|entry| !entry.starts_with("delete")));
}
