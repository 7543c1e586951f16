//! Line-oriented terminal front end.
//!
//! Input lines starting with `/` are commands; any other line is sent to the selected peer.
//! A leading `//` sends the rest of the line verbatim.

use std::io::Write;

use chrono::{DateTime, Local, Utc};
use snafu::Snafu;

use crate::app::{ChatApp, Frontend, GateState};
use crate::auth::AuthTab;
use crate::chat::{Command, ConnectionState, Direction, direction};
use crate::notification::{NotificationId, NotificationKind};

/// Messages of the open conversation printed per frame.
pub const VISIBLE_TAIL: usize = 20;

pub const HELP: &str = "\
commands:
  /login <email> <password>    sign in
  /signup <email> <password>   create an account
  /tab login|signup            switch the auth form
  /show-password               toggle password visibility
  /logout                      sign out
  /add <email>                 start a conversation with a user
  /search <text>               find users by email
  /peer <email>                open a listed conversation
  /dismiss <id>                dismiss a notification
  /help                        show this help
  /quit                        exit
any other line is sent to the open conversation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    Command(Command),
    Help,
    Empty,
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ParseError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("`/{command}` expects {expected}"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
        expected: &'static str,
    },
}

pub fn parse_line(line: &str) -> Result<TerminalInput, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(TerminalInput::Empty);
    }
    if let Some(verbatim) = line.strip_prefix("//") {
        return Ok(TerminalInput::Command(Command::Send {
            text: format!("/{verbatim}"),
        }));
    }
    let Some(command_line) = line.strip_prefix('/') else {
        return Ok(TerminalInput::Command(Command::Send {
            text: line.to_string(),
        }));
    };

    let mut parts = command_line.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args = parts.collect::<Vec<_>>();

    let command = match name {
        "login" | "signup" => {
            let [email, password] = args.as_slice() else {
                return MissingArgumentSnafu {
                    stage: "parse-credentials",
                    command: if name == "login" { "login" } else { "signup" },
                    expected: "<email> <password>",
                }
                .fail();
            };
            let (email, password) = (email.to_string(), password.to_string());
            if name == "login" {
                Command::Login { email, password }
            } else {
                Command::SignUp { email, password }
            }
        }
        "tab" => match args.first().copied() {
            Some("login") => Command::SwitchTab(AuthTab::Login),
            Some("signup") => Command::SwitchTab(AuthTab::SignUp),
            _ => {
                return MissingArgumentSnafu {
                    stage: "parse-tab",
                    command: "tab",
                    expected: "`login` or `signup`",
                }
                .fail();
            }
        },
        "show-password" => Command::TogglePasswordVisibility,
        "logout" => Command::SignOut,
        "add" => Command::AddPeer {
            email: single_argument(&args, "add", "<email>")?,
        },
        "search" => {
            if args.is_empty() {
                return MissingArgumentSnafu {
                    stage: "parse-search",
                    command: "search",
                    expected: "<text>",
                }
                .fail();
            }
            Command::SearchUsers {
                fragment: args.join(" "),
            }
        }
        "peer" => Command::SelectPeer {
            email: single_argument(&args, "peer", "<email>")?,
        },
        "dismiss" => {
            let id = args
                .first()
                .and_then(|raw| raw.parse::<u64>().ok())
                .ok_or_else(|| {
                    MissingArgumentSnafu {
                        stage: "parse-dismiss",
                        command: "dismiss",
                        expected: "a notification id",
                    }
                    .build()
                })?;
            Command::Dismiss(NotificationId(id))
        }
        "help" => return Ok(TerminalInput::Help),
        "quit" | "exit" => Command::Quit,
        other => {
            return UnknownCommandSnafu {
                stage: "parse-command-name",
                name: other.to_string(),
            }
            .fail();
        }
    };

    Ok(TerminalInput::Command(command))
}

fn single_argument(
    args: &[&str],
    command: &'static str,
    expected: &'static str,
) -> Result<String, ParseError> {
    match args {
        [value] => Ok((*value).to_string()),
        _ => MissingArgumentSnafu {
            stage: "parse-single-argument",
            command,
            expected,
        }
        .fail(),
    }
}

/// Prints a frame whenever the rendered text changes.
pub struct TerminalFrontend<W: Write> {
    out: W,
    last_frame: String,
}

impl<W: Write> TerminalFrontend<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_frame: String::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Frontend for TerminalFrontend<W> {
    fn render(&mut self, app: &ChatApp) {
        let frame = render_frame(app);
        if frame == self.last_frame {
            return;
        }

        if let Err(error) = writeln!(self.out, "{frame}").and_then(|()| self.out.flush()) {
            tracing::warn!(error = %error, "failed to write frame");
        }
        self.last_frame = frame;
    }
}

pub fn render_frame(app: &ChatApp) -> String {
    let mut lines = vec!["----".to_string()];

    match app.gate() {
        GateState::Loading => lines.push("Checking session...".to_string()),
        GateState::Unauthenticated => {
            let auth = app.auth();
            let tab = match auth.tab() {
                AuthTab::Login => "Login",
                AuthTab::SignUp => "Sign up",
            };
            let mut header = format!("[{tab}]");
            if !auth.email().is_empty() {
                header.push_str(&format!(" {}", auth.email()));
            }
            if auth.is_busy() {
                header.push_str(" (working...)");
            }
            if auth.show_password() {
                header.push_str(" (passwords visible)");
            }
            lines.push(header);
        }
        GateState::Authenticated(user) => {
            lines.push(format!("Signed in as {}", user.email));
            if let Some(view) = app.conversation() {
                let connection = match view.connection() {
                    ConnectionState::Connecting => "connecting".to_string(),
                    ConnectionState::Online => "online".to_string(),
                    ConnectionState::Offline { retry_in } => {
                        format!("offline, retrying in {} ms", retry_in.as_millis())
                    }
                    ConnectionState::Closed => "disconnected".to_string(),
                };
                lines.push(format!("status: {connection}"));

                let selected = view.sidebar().selected();
                let peers = view
                    .sidebar()
                    .peers()
                    .into_iter()
                    .map(|entry| {
                        if Some(entry.uid) == selected {
                            format!("*{}", entry.label())
                        } else {
                            entry.label()
                        }
                    })
                    .collect::<Vec<_>>();
                if !peers.is_empty() {
                    lines.push(format!("peers: {}", peers.join(", ")));
                }

                let results = view.sidebar().search_results();
                if !results.is_empty() {
                    let emails = results
                        .iter()
                        .map(|user| user.email.as_str())
                        .collect::<Vec<_>>();
                    lines.push(format!("search: {}", emails.join(", ")));
                }

                match view.sidebar().selected_peer() {
                    Some(peer) => {
                        lines.push(format!("== {} ==", peer.label()));
                        let messages = view.visible_messages();
                        let skip = messages.len().saturating_sub(VISIBLE_TAIL);
                        for message in &messages[skip..] {
                            let marker = match direction(message, user.uid) {
                                Direction::Outgoing => ">",
                                Direction::Incoming => "<",
                            };
                            lines.push(format!(
                                "{} {marker} {}",
                                message_time(message.created_at_unix_millis),
                                message.text
                            ));
                        }
                    }
                    None => lines.push("(no conversation open, use /add or /peer)".to_string()),
                }
            }
        }
    }

    for notification in app.notifications().items() {
        let kind = match notification.kind {
            NotificationKind::Info => "info",
            NotificationKind::Success => "ok",
            NotificationKind::Error => "error",
        };
        lines.push(format!(
            "[{}] {kind}: {}",
            notification.id, notification.message
        ));
    }

    lines.join("\n")
}

/// Local wall-clock `HH:MM` of a store timestamp.
fn message_time(created_at_unix_millis: u64) -> String {
    i64::try_from(created_at_unix_millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|at| at.with_timezone(&Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}
