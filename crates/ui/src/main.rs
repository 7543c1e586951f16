use std::io::BufRead;
use std::sync::Arc;

use firechat_identity::LocalIdentityProvider;
use firechat_storage::SqliteStorage;
use snafu::ResultExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use ui::app::{AppError, ChatApp, OpenStoreSnafu, TerminalSnafu};
use ui::chat::Command;
use ui::settings::SettingsStore;
use ui::terminal::{HELP, TerminalFrontend, TerminalInput, parse_line};

const COMMAND_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Logs go to stderr so they do not interleave with rendered frames.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(
        config = ?settings_store.config_path(),
        database = ?settings.database_path,
        "starting firechat"
    );

    let storage = Arc::new(
        SqliteStorage::open(&settings.database_location())
            .await
            .context(OpenStoreSnafu {
                stage: "open-sqlite-storage",
            })?,
    );
    let provider = Arc::new(LocalIdentityProvider::new(
        storage.clone(),
        settings.identity_config(),
    ));
    let _session_monitor = provider.spawn_session_monitor(settings.session_check_interval());

    let app = ChatApp::new(provider.clone(), storage, settings);

    // The gate shows Loading until the persisted session has been checked.
    let restore_provider = provider.clone();
    tokio::spawn(async move {
        if let Err(error) = restore_provider.restore_session().await {
            tracing::warn!(error = %error, "could not restore previous session");
        }
    });

    let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
    // Blocking stdin reads live on their own thread so shutdown never waits on them.
    std::thread::spawn(move || {
        if let Err(error) = read_commands(command_tx) {
            tracing::error!(error = %error, "stopped reading commands");
        }
    });

    let mut frontend = TerminalFrontend::new(std::io::stdout());
    app.run(commands, &mut frontend).await
}

fn read_commands(commands: mpsc::Sender<Command>) -> Result<(), AppError> {
    println!("{HELP}");

    for line in std::io::stdin().lock().lines() {
        let line = line.context(TerminalSnafu {
            stage: "read-stdin-line",
        })?;
        let command = match parse_line(&line) {
            Ok(TerminalInput::Command(command)) => command,
            Ok(TerminalInput::Help) => {
                println!("{HELP}");
                continue;
            }
            Ok(TerminalInput::Empty) => continue,
            Err(error) => {
                println!("{error}");
                continue;
            }
        };

        let quit = command == Command::Quit;
        if commands.blocking_send(command).is_err() || quit {
            break;
        }
    }

    Ok(())
}
