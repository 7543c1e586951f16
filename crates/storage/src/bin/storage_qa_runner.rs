use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use firechat_storage::{
    MessageId, MessageQuery, MessageStore, NewMessage, NewUser, ReconnectPolicy, SessionTokenId,
    SessionTokenStore, SqliteStorage, StorageError, SubscriptionEvent, UserId, UserStore,
    subscribe_messages,
};

const LIVE_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    FkViolation,
    ParticipantsGuard,
    MessageWindow,
    QuarantineRow,
    TokenRevoke,
    LiveRefresh,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "fk_violation" => Some(Self::FkViolation),
            "participants_guard" => Some(Self::ParticipantsGuard),
            "message_window" => Some(Self::MessageWindow),
            "quarantine_row" => Some(Self::QuarantineRow),
            "token_revoke" => Some(Self::TokenRevoke),
            "live_refresh" => Some(Self::LiveRefresh),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::FkViolation => "fk_violation",
            Self::ParticipantsGuard => "participants_guard",
            Self::MessageWindow => "message_window",
            Self::QuarantineRow => "quarantine_row",
            Self::TokenRevoke => "token_revoke",
            Self::LiveRefresh => "live_refresh",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::FkViolation => run_fk_violation(require_db_path(&args, "fk_violation")?).await,
        Scenario::ParticipantsGuard => {
            run_participants_guard(require_db_path(&args, "participants_guard")?).await
        }
        Scenario::MessageWindow => {
            run_message_window(require_db_path(&args, "message_window")?).await
        }
        Scenario::QuarantineRow => {
            run_quarantine_row(require_db_path(&args, "quarantine_row")?).await
        }
        Scenario::TokenRevoke => run_token_revoke(require_db_path(&args, "token_revoke")?).await,
        Scenario::LiveRefresh => run_live_refresh(require_db_path(&args, "live_refresh")?).await,
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}

fn fail<T>(
    stage: &'static str,
    scenario: &'static str,
    reason: impl Into<String>,
) -> RunnerResult<T> {
    ScenarioFailedSnafu {
        stage,
        scenario,
        reason: reason.into(),
    }
    .fail()
}

async fn open(db_path: &str, stage: &'static str) -> RunnerResult<SqliteStorage> {
    SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })
}

async fn create_qa_user(storage: &SqliteStorage, stage: &'static str) -> RunnerResult<UserId> {
    let record = storage
        .create_user(NewUser {
            email: format!("qa-{}@example.com", UserId::new_v7()),
            display_name: None,
            password_hash: "qa-hash".to_string(),
            password_salt: "qa-salt".to_string(),
        })
        .await
        .context(StorageValidationSnafu { stage })?;
    Ok(record.id)
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let user_id = UserId::new_v7();
    let message_id = MessageId::new_v7();
    let token_id = SessionTokenId::new_v7();

    let roundtrip_ok = UserId::from_str(&user_id.to_string()).ok() == Some(user_id)
        && MessageId::from_str(&message_id.to_string()).ok() == Some(message_id)
        && SessionTokenId::from_str(&token_id.to_string()).ok() == Some(token_id);

    println!("id_roundtrip={roundtrip_ok}");
    if !roundtrip_ok {
        return fail(
            "scenario-id-roundtrip",
            "id_roundtrip",
            "an id did not survive display and parse",
        );
    }

    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let invalid_input = "not-a-valid-uuid";
    let invalid_id_error = UserId::parse(invalid_input).is_err()
        && MessageId::parse(invalid_input).is_err()
        && SessionTokenId::parse(invalid_input).is_err();

    println!("invalid_id_error={invalid_id_error}");
    if !invalid_id_error {
        return fail(
            "scenario-id-invalid",
            "id_invalid",
            "at least one id wrapper accepted malformed uuid input",
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_fk_violation(path).await?;
        run_participants_guard(path).await?;
        run_message_window(path).await?;
        run_quarantine_row(path).await?;
        run_token_revoke(path).await?;
        run_live_refresh(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let storage = open(db_path, "scenario-schema-init-open").await?;
    let pool = storage.pool();

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'session_tokens', 'messages')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;
    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = ["users", "session_tokens", "messages"]
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-foreign-keys",
        })?;
    let busy_timeout = sqlx::query_scalar::<_, i64>("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-busy-timeout",
        })?;

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    println!("foreign_keys={foreign_keys}");
    println!("busy_timeout={busy_timeout}");

    if !schema_ok {
        return fail(
            "scenario-schema-init-tables",
            "schema_init",
            "required tables are missing",
        );
    }
    if journal_mode != "wal" {
        return fail(
            "scenario-schema-init-wal",
            "schema_init",
            format!("expected wal journal mode, found {journal_mode}"),
        );
    }
    if foreign_keys != 1 || busy_timeout < 5_000 {
        return fail(
            "scenario-schema-init-pragmas",
            "schema_init",
            "foreign keys or busy timeout not configured",
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_fk_violation(db_path: &str) -> RunnerResult<()> {
    let storage = open(db_path, "scenario-fk-violation-open").await?;

    let inserted = sqlx::query(
        "INSERT INTO session_tokens (id, user_id, created_at, revoked_at) VALUES (?, ?, 0, NULL)",
    )
    .bind(SessionTokenId::new_v7().to_string())
    .bind(UserId::new_v7().to_string())
    .execute(storage.pool())
    .await;

    let fk_rejected = inserted.is_err();
    println!("fk_rejected={fk_rejected}");
    if !fk_rejected {
        return fail(
            "scenario-fk-violation-insert",
            "fk_violation",
            "session token for a missing user was accepted",
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_participants_guard(db_path: &str) -> RunnerResult<()> {
    let storage = open(db_path, "scenario-participants-guard-open").await?;
    let user_id = UserId::new_v7();

    let appended = storage
        .append_message(NewMessage::new(user_id, user_id, "to myself"))
        .await;
    let self_rejected = matches!(appended, Err(StorageError::InvalidParticipants { .. }));

    println!("self_addressed_rejected={self_rejected}");
    if !self_rejected {
        return fail(
            "scenario-participants-guard-append",
            "participants_guard",
            "a message with identical participants was accepted",
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_message_window(db_path: &str) -> RunnerResult<()> {
    let storage = open(db_path, "scenario-message-window-open").await?;
    let alice = create_qa_user(&storage, "scenario-message-window-alice").await?;
    let bob = create_qa_user(&storage, "scenario-message-window-bob").await?;

    let mut first = None;
    for index in 0..51 {
        let record = storage
            .append_message(NewMessage::new(alice, bob, format!("message {index}")))
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-message-window-append",
            })?;
        first.get_or_insert(record.id);
    }
    let first = first.context(ScenarioFailedSnafu {
        stage: "scenario-message-window-first",
        scenario: "message_window",
        reason: "no message was appended".to_string(),
    })?;

    let window = storage
        .query_messages(MessageQuery::recent(bob))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-message-window-recent",
        })?;
    let oldest_dropped = window.len() == 50 && window.messages.iter().all(|m| m.id != first);

    let older = storage
        .query_messages(MessageQuery::recent(bob).with_limit(1).with_offset(50))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-message-window-older",
        })?;
    let oldest_retrievable = older.messages.first().map(|m| m.id) == Some(first);

    println!("window_len={}", window.len());
    println!("oldest_dropped={oldest_dropped}");
    println!("oldest_retrievable={oldest_retrievable}");
    if !oldest_dropped || !oldest_retrievable {
        return fail(
            "scenario-message-window-check",
            "message_window",
            "the 50-message window or its paging is wrong",
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_quarantine_row(db_path: &str) -> RunnerResult<()> {
    let storage = open(db_path, "scenario-quarantine-row-open").await?;
    let reader = UserId::new_v7();
    let stranger = UserId::new_v7();

    // Sender outside its own participant pair.
    let (low, high) = if reader < stranger {
        (reader, stranger)
    } else {
        (stranger, reader)
    };
    sqlx::query(
        "INSERT INTO messages (id, sender_id, recipient_id, participant_low, participant_high, text, created_at) VALUES (?, ?, ?, ?, ?, 'forged', 0)",
    )
    .bind(MessageId::new_v7().to_string())
    .bind(UserId::new_v7().to_string())
    .bind(reader.to_string())
    .bind(low.to_string())
    .bind(high.to_string())
    .execute(storage.pool())
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-quarantine-row-insert",
    })?;

    let set = storage
        .query_messages(MessageQuery::recent(reader))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-quarantine-row-query",
        })?;

    println!("quarantined={}", set.quarantined);
    println!("visible={}", set.len());
    if set.quarantined != 1 || !set.is_empty() {
        return fail(
            "scenario-quarantine-row-check",
            "quarantine_row",
            "malformed row was not quarantined",
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_token_revoke(db_path: &str) -> RunnerResult<()> {
    let storage = open(db_path, "scenario-token-revoke-open").await?;
    let user_id = create_qa_user(&storage, "scenario-token-revoke-user").await?;

    let first = storage
        .issue_session_token(user_id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-token-revoke-issue-first",
        })?;
    let second = storage
        .issue_session_token(user_id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-token-revoke-issue-second",
        })?;

    storage
        .revoke_session_token(first.id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-token-revoke-single",
        })?;
    let first_resolves = storage
        .resolve_session_token(first.id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-token-revoke-resolve-first",
        })?
        .is_some();

    let revoked_rest = storage
        .revoke_user_sessions(user_id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-token-revoke-all",
        })?;
    let second_resolves = storage
        .resolve_session_token(second.id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-token-revoke-resolve-second",
        })?
        .is_some();

    println!("revoked_token_resolves={first_resolves}");
    println!("bulk_revoked={revoked_rest}");
    println!("bulk_revoked_token_resolves={second_resolves}");
    if first_resolves || second_resolves || revoked_rest != 1 {
        return fail(
            "scenario-token-revoke-check",
            "token_revoke",
            "revoked tokens still resolve",
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_live_refresh(db_path: &str) -> RunnerResult<()> {
    let storage = Arc::new(open(db_path, "scenario-live-refresh-open").await?);
    let alice = create_qa_user(&storage, "scenario-live-refresh-alice").await?;
    let bob = create_qa_user(&storage, "scenario-live-refresh-bob").await?;

    let mut subscription =
        subscribe_messages(storage.clone(), bob, 50, ReconnectPolicy::default()).spawn();
    let initial = next_snapshot_len(&mut subscription).await?;

    storage
        .append_message(NewMessage::new(alice, bob, "live"))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-live-refresh-append",
        })?;
    let refreshed = next_snapshot_len(&mut subscription).await?;
    subscription.cancel();

    println!("initial_len={initial}");
    println!("refreshed_len={refreshed}");
    if refreshed != initial + 1 {
        return fail(
            "scenario-live-refresh-check",
            "live_refresh",
            "append did not produce a refreshed snapshot",
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn next_snapshot_len(
    subscription: &mut firechat_storage::MessageSubscription,
) -> RunnerResult<usize> {
    loop {
        let event = tokio::time::timeout(LIVE_EVENT_TIMEOUT, subscription.recv())
            .await
            .ok()
            .flatten();
        match event {
            Some(SubscriptionEvent::Snapshot(set)) => return Ok(set.len()),
            Some(SubscriptionEvent::Online | SubscriptionEvent::Offline { .. }) => continue,
            None => {
                return fail(
                    "scenario-live-refresh-recv",
                    "live_refresh",
                    "no snapshot before timeout",
                );
            }
        }
    }
}
