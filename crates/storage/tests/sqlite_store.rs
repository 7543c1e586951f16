use firechat_storage::{
    MessageQuery, MessageStore, NewMessage, NewUser, SessionTokenStore, SqliteStorage,
    StorageError, UserId, UserStore,
};

async fn open_store(dir: &tempfile::TempDir) -> SqliteStorage {
    let path = dir.path().join("firechat.db");
    SqliteStorage::open(&path.display().to_string())
        .await
        .expect("open sqlite storage")
}

fn new_user(email: &str) -> NewUser {
    NewUser {
        email: email.to_string(),
        display_name: None,
        password_hash: "hash".to_string(),
        password_salt: "salt".to_string(),
    }
}

#[tokio::test]
async fn duplicate_email_is_a_conflict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;

    let alice = store
        .create_user(new_user("alice@x.com"))
        .await
        .expect("create alice");
    assert_eq!(alice.email, "alice@x.com");

    let error = store
        .create_user(new_user("alice@x.com"))
        .await
        .expect_err("duplicate email must fail");
    assert!(matches!(error, StorageError::Conflict { entity: "user", .. }));

    let found = store
        .find_credentials_by_email("alice@x.com")
        .await
        .expect("lookup")
        .expect("alice exists");
    assert_eq!(found.user.id, alice.id);
    assert_eq!(found.password_hash, "hash");
}

#[tokio::test]
async fn search_matches_fragment_and_escapes_wildcards() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;

    for email in ["alice@x.com", "bob@x.com", "carol@y.org"] {
        store.create_user(new_user(email)).await.expect("create");
    }

    let hits = store.search_users("x.com", 10).await.expect("search");
    let emails = hits.iter().map(|user| user.email.as_str()).collect::<Vec<_>>();
    assert_eq!(emails, vec!["alice@x.com", "bob@x.com"]);

    let wildcard = store.search_users("%", 10).await.expect("search");
    assert!(wildcard.is_empty());
}

#[tokio::test]
async fn revoked_tokens_no_longer_resolve() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let alice = store
        .create_user(new_user("alice@x.com"))
        .await
        .expect("create alice");

    let first = store.issue_session_token(alice.id).await.expect("issue");
    let second = store.issue_session_token(alice.id).await.expect("issue");

    let resolved = store
        .resolve_session_token(first.id)
        .await
        .expect("resolve")
        .expect("live token");
    assert_eq!(resolved.id, alice.id);

    store.revoke_session_token(first.id).await.expect("revoke");
    assert!(
        store
            .resolve_session_token(first.id)
            .await
            .expect("resolve")
            .is_none()
    );

    let revoked = store.revoke_user_sessions(alice.id).await.expect("revoke all");
    assert_eq!(revoked, 1);
    assert!(
        store
            .resolve_session_token(second.id)
            .await
            .expect("resolve")
            .is_none()
    );
}

#[tokio::test]
async fn messages_are_filtered_by_participant_and_ordered_newest_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let (u1, u2, u3) = (UserId::new_v7(), UserId::new_v7(), UserId::new_v7());

    store
        .append_message(NewMessage::new(u1, u2, "one"))
        .await
        .expect("append");
    store
        .append_message(NewMessage::new(u2, u3, "elsewhere"))
        .await
        .expect("append");
    store
        .append_message(NewMessage::new(u2, u1, "two"))
        .await
        .expect("append");

    let set = store
        .query_messages(MessageQuery::recent(u1))
        .await
        .expect("query");
    let texts = set
        .messages
        .iter()
        .map(|message| message.text.as_str())
        .collect::<Vec<_>>();
    assert_eq!(texts, vec!["two", "one"]);
    assert_eq!(set.quarantined, 0);
    assert!(set.messages.iter().all(|message| message.participants.contains(u1)));
}

#[tokio::test]
async fn self_addressed_append_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let u1 = UserId::new_v7();

    let error = store
        .append_message(NewMessage::new(u1, u1, "me"))
        .await
        .expect_err("self pair is invalid");
    assert!(matches!(error, StorageError::InvalidParticipants { .. }));
}

#[tokio::test]
async fn oldest_message_leaves_window_but_stays_queryable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let (u1, u2) = (UserId::new_v7(), UserId::new_v7());

    let mut first_id = None;
    for index in 0..51 {
        let record = store
            .append_message(NewMessage::new(u1, u2, format!("message-{index}")))
            .await
            .expect("append");
        if index == 0 {
            first_id = Some(record.id);
        }
    }
    let first_id = first_id.expect("first message recorded");

    let window = store
        .query_messages(MessageQuery::recent(u1))
        .await
        .expect("query window");
    assert_eq!(window.len(), 50);
    assert!(window.messages.iter().all(|message| message.id != first_id));

    let older = store
        .query_messages(MessageQuery::recent(u1).with_offset(50).with_limit(10))
        .await
        .expect("query older page");
    assert_eq!(older.len(), 1);
    assert_eq!(older.messages[0].id, first_id);

    let direct = store
        .get_message(first_id)
        .await
        .expect("get")
        .expect("still stored");
    assert_eq!(direct.text, "message-0");
}

#[tokio::test]
async fn malformed_rows_are_quarantined() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let (u1, u2) = (UserId::new_v7(), UserId::new_v7());

    store
        .append_message(NewMessage::new(u1, u2, "valid"))
        .await
        .expect("append");

    // Participant pair that does not contain the sender.
    sqlx::query(
        "INSERT INTO messages (id, sender_id, recipient_id, participant_low, participant_high, text, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(uuid::Uuid::now_v7().to_string())
    .bind(UserId::new_v7().to_string())
    .bind(u2.to_string())
    .bind(u1.to_string())
    .bind(u2.to_string())
    .bind("forged")
    .bind(i64::MAX / 2)
    .execute(store.pool())
    .await
    .expect("insert raw row");

    let set = store
        .query_messages(MessageQuery::recent(u1))
        .await
        .expect("query");
    assert_eq!(set.len(), 1);
    assert_eq!(set.quarantined, 1);
    assert_eq!(set.messages[0].text, "valid");
}
