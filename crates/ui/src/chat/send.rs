use firechat_storage::{MessageId, MessageStore, NewMessage, StorageError, UserId};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SendError {
    #[snafu(display("message text is empty"))]
    EmptyText { stage: &'static str },
    #[snafu(display("cannot send a message to yourself"))]
    SelfAddressed { stage: &'static str },
    #[snafu(display("failed to send message on `{stage}`: {source}"))]
    Write {
        stage: &'static str,
        source: StorageError,
    },
}

/// Appends one message. The live subscription, not the caller, reflects it in the view.
pub async fn send_message(
    store: &dyn MessageStore,
    sender: UserId,
    recipient: UserId,
    text: &str,
) -> Result<MessageId, SendError> {
    if text.trim().is_empty() {
        return EmptyTextSnafu {
            stage: "send-message-validate-text",
        }
        .fail();
    }
    if sender == recipient {
        return SelfAddressedSnafu {
            stage: "send-message-validate-recipient",
        }
        .fail();
    }

    let record = store
        .append_message(NewMessage::new(sender, recipient, text))
        .await
        .context(WriteSnafu {
            stage: "send-message-append",
        })?;

    tracing::debug!(
        message_id = %record.id,
        sender = %sender,
        recipient = %recipient,
        "message sent"
    );
    Ok(record.id)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use firechat_storage::{
        BoxFuture, ChangeNotice, MessageQuery, MessageRecord, MessageSet, Participants,
        StorageResult,
    };
    use tokio::sync::broadcast;

    use super::*;

    /// In-memory store that records appends, or rejects them when `failing` is set.
    struct RecordingStore {
        failing: bool,
        appended: Mutex<Vec<NewMessage>>,
        changes: broadcast::Sender<ChangeNotice>,
    }

    impl RecordingStore {
        fn new(failing: bool) -> Self {
            let (changes, _) = broadcast::channel(4);
            Self {
                failing,
                appended: Mutex::new(Vec::new()),
                changes,
            }
        }

        fn appended(&self) -> usize {
            self.appended.lock().expect("lock").len()
        }
    }

    impl MessageStore for RecordingStore {
        fn append_message(
            &self,
            input: NewMessage,
        ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
            Box::pin(async move {
                if self.failing {
                    return Err(StorageError::InvariantViolation {
                        stage: "recording-store-append",
                        details: "disk full".to_string(),
                    });
                }
                let record = MessageRecord {
                    id: MessageId::new_v7(),
                    seq: self.appended() as u64 + 1,
                    sender_id: input.sender_id,
                    recipient_id: input.recipient_id,
                    participants: Participants::new(input.sender_id, input.recipient_id)?,
                    text: input.text.clone(),
                    created_at_unix_millis: 0,
                };
                self.appended.lock().expect("lock").push(input);
                Ok(record)
            })
        }

        fn query_messages(
            &self,
            _query: MessageQuery,
        ) -> BoxFuture<'_, StorageResult<MessageSet>> {
            Box::pin(async { Ok(MessageSet::default()) })
        }

        fn get_message(
            &self,
            _message_id: MessageId,
        ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
            Box::pin(async { Ok(None) })
        }

        fn watch_changes(&self) -> broadcast::Receiver<ChangeNotice> {
            self.changes.subscribe()
        }
    }

    #[tokio::test]
    async fn appends_one_message_with_both_participants() {
        let store = RecordingStore::new(false);
        let (alice, bob) = (UserId::new_v7(), UserId::new_v7());

        send_message(&store, alice, bob, "hi").await.expect("sent");

        let appended = store.appended.lock().expect("lock");
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].sender_id, alice);
        assert_eq!(appended[0].recipient_id, bob);
        assert_eq!(appended[0].text, "hi");
    }

    #[tokio::test]
    async fn blank_text_is_rejected_before_the_store() {
        let store = RecordingStore::new(false);
        let (alice, bob) = (UserId::new_v7(), UserId::new_v7());

        for text in ["", "   ", "\n\t"] {
            let error = send_message(&store, alice, bob, text)
                .await
                .expect_err("blank text");
            assert!(matches!(error, SendError::EmptyText { .. }));
        }
        assert_eq!(store.appended(), 0);
    }

    #[tokio::test]
    async fn message_to_self_is_rejected_before_the_store() {
        let store = RecordingStore::new(false);
        let alice = UserId::new_v7();

        let error = send_message(&store, alice, alice, "note to self")
            .await
            .expect_err("self addressed");
        assert!(matches!(error, SendError::SelfAddressed { .. }));
        assert_eq!(store.appended(), 0);
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_write_error() {
        let store = RecordingStore::new(true);

        let error = send_message(&store, UserId::new_v7(), UserId::new_v7(), "hi")
            .await
            .expect_err("store rejects");
        match error {
            SendError::Write { stage, source } => {
                assert_eq!(stage, "send-message-append");
                assert!(matches!(source, StorageError::InvariantViolation { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
