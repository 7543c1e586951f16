use std::sync::Arc;
use std::time::Duration;

use firechat_identity::{
    AuthErrorReason, IdentityConfig, IdentityProvider, LocalIdentityProvider, SessionFile,
    SessionStatus,
};
use firechat_storage::SqliteStorage;
use tokio::time::timeout;

async fn open_store(dir: &tempfile::TempDir) -> Arc<SqliteStorage> {
    let path = dir.path().join("identity.db");
    Arc::new(
        SqliteStorage::open(&path.display().to_string())
            .await
            .expect("open sqlite storage"),
    )
}

fn provider(store: &Arc<SqliteStorage>, config: IdentityConfig) -> LocalIdentityProvider {
    LocalIdentityProvider::new(store.clone(), config)
}

#[tokio::test]
async fn session_starts_unknown_then_signed_out_then_signed_in() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let identity = provider(&store, IdentityConfig::default());
    let mut session = identity.observe_session();

    assert_eq!(*session.borrow(), SessionStatus::Unknown);

    assert_eq!(identity.restore_session().await.expect("restore"), None);
    session.changed().await.expect("status published");
    assert_eq!(*session.borrow_and_update(), SessionStatus::SignedOut);

    let user = identity
        .sign_up("New@Example.com", "secret1")
        .await
        .expect("sign up");
    assert_eq!(user.email, "new@example.com");

    session.changed().await.expect("status published");
    assert_eq!(
        session.borrow_and_update().user().map(|user| user.uid),
        Some(user.uid)
    );
}

#[tokio::test]
async fn wrong_password_is_rejected_without_signing_in() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let identity = provider(&store, IdentityConfig::default());

    identity
        .sign_up("a@x.com", "correct-horse")
        .await
        .expect("sign up");
    identity.sign_out().await.expect("sign out");
    assert_eq!(identity.status(), SessionStatus::SignedOut);

    let error = identity
        .sign_in("a@x.com", "wrong-horse")
        .await
        .expect_err("wrong password");
    assert_eq!(error.reason(), AuthErrorReason::InvalidCredentials);

    let unknown = identity
        .sign_in("nobody@x.com", "correct-horse")
        .await
        .expect_err("unknown email");
    assert_eq!(unknown.reason(), AuthErrorReason::InvalidCredentials);
    assert_eq!(identity.status(), SessionStatus::SignedOut);

    let user = identity
        .sign_in(" A@X.com ", "correct-horse")
        .await
        .expect("sign in");
    assert_eq!(identity.status(), SessionStatus::SignedIn(user));
}

#[tokio::test]
async fn sign_up_validates_email_password_and_uniqueness() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let identity = provider(&store, IdentityConfig::default());

    let weak = identity
        .sign_up("a@x.com", "12345")
        .await
        .expect_err("weak password");
    assert_eq!(weak.reason(), AuthErrorReason::WeakPassword);

    let invalid = identity
        .sign_up("not-an-email", "123456")
        .await
        .expect_err("invalid email");
    assert_eq!(invalid.reason(), AuthErrorReason::InvalidEmail);

    identity.sign_up("a@x.com", "123456").await.expect("sign up");
    let duplicate = identity
        .sign_up("A@x.com", "654321")
        .await
        .expect_err("duplicate email");
    assert_eq!(duplicate.reason(), AuthErrorReason::EmailInUse);
}

#[tokio::test]
async fn persisted_session_survives_restart_until_revoked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let session_path = dir.path().join("session.json");
    let config = IdentityConfig::default().with_session_file(&session_path);

    let first = provider(&store, config.clone());
    let user = first.sign_up("a@x.com", "123456").await.expect("sign up");
    assert!(
        SessionFile::new(session_path.clone())
            .load()
            .expect("load")
            .is_some()
    );

    let second = provider(&store, config.clone());
    let restored = second.restore_session().await.expect("restore");
    assert_eq!(restored.as_ref().map(|user| user.uid), Some(user.uid));

    assert_eq!(first.revoke_all_sessions(user.uid).await.expect("revoke"), 1);
    second.check_session().await.expect("check");
    assert_eq!(second.status(), SessionStatus::SignedOut);
    assert_eq!(
        SessionFile::new(session_path.clone())
            .load()
            .expect("load"),
        None
    );

    let third = provider(&store, config);
    assert_eq!(third.restore_session().await.expect("restore"), None);
    assert_eq!(third.status(), SessionStatus::SignedOut);
}

#[tokio::test]
async fn session_monitor_signs_out_after_remote_revocation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let identity = Arc::new(provider(&store, IdentityConfig::default()));
    let user = identity.sign_up("a@x.com", "123456").await.expect("sign up");
    let mut session = identity.observe_session();
    session.borrow_and_update();

    let _monitor = identity.spawn_session_monitor(Duration::from_millis(10));
    identity
        .revoke_all_sessions(user.uid)
        .await
        .expect("revoke");

    timeout(Duration::from_secs(5), session.changed())
        .await
        .expect("monitor reacts before timeout")
        .expect("status published");
    assert_eq!(*session.borrow(), SessionStatus::SignedOut);
}

#[tokio::test]
async fn sign_out_ends_the_session_even_when_the_file_cannot_be_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let session_path = dir.path().join("session.json");
    let identity = provider(
        &store,
        IdentityConfig::default().with_session_file(&session_path),
    );
    identity.sign_up("a@x.com", "123456").await.expect("sign up");

    std::fs::remove_file(&session_path).expect("remove session file");
    std::fs::create_dir(&session_path).expect("directory in its place");
    std::fs::write(session_path.join("keep"), "x").expect("make directory non-empty");

    let error = identity
        .sign_out()
        .await
        .expect_err("file removal fails");
    assert_eq!(error.reason(), AuthErrorReason::Network);
    assert_eq!(identity.status(), SessionStatus::SignedOut);

    identity.check_session().await.expect("check");
    assert_eq!(identity.status(), SessionStatus::SignedOut);
}

#[tokio::test]
async fn stopped_monitor_no_longer_checks_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let identity = Arc::new(provider(&store, IdentityConfig::default()));
    let user = identity.sign_up("a@x.com", "123456").await.expect("sign up");

    let monitor = identity.spawn_session_monitor(Duration::from_millis(10));
    monitor.stop().await;
    identity
        .revoke_all_sessions(user.uid)
        .await
        .expect("revoke");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        identity.status().user().map(|user| user.uid),
        Some(user.uid)
    );
}

#[tokio::test]
async fn peer_lookup_and_search() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let identity = provider(&store, IdentityConfig::default());

    let alice = identity
        .sign_up("alice@example.com", "123456")
        .await
        .expect("sign up alice");
    identity
        .sign_up("albert@example.com", "123456")
        .await
        .expect("sign up albert");
    identity
        .sign_up("bob@example.com", "123456")
        .await
        .expect("sign up bob");

    let found = identity
        .lookup_user("ALICE@example.com")
        .await
        .expect("lookup");
    assert_eq!(found.map(|user| user.uid), Some(alice.uid));
    assert_eq!(
        identity.get_user(alice.uid).await.expect("get user"),
        Some(alice.clone())
    );
    assert_eq!(
        identity.lookup_user("carol@example.com").await.expect("lookup"),
        None
    );

    let matches = identity.search_users("al", 10).await.expect("search");
    let mut emails = matches
        .into_iter()
        .map(|user| user.email)
        .collect::<Vec<_>>();
    emails.sort();
    assert_eq!(emails, vec!["albert@example.com", "alice@example.com"]);
    assert!(identity.search_users("  ", 10).await.expect("search").is_empty());
}
