use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use firechat_identity::{DEFAULT_MIN_PASSWORD_LENGTH, IdentityConfig};
use firechat_storage::{DEFAULT_MESSAGE_WINDOW, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "firechat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "FIRECHAT_";
pub const DATABASE_FILE_NAME: &str = "firechat.db";
pub const SESSION_FILE_NAME: &str = "session.json";

pub const DEFAULT_NOTIFICATION_TTL_MS: u64 = 4_000;
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 250;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 8_000;
pub const DEFAULT_SESSION_CHECK_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
    #[serde(default = "default_message_window")]
    pub message_window: usize,
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    #[serde(default = "default_notification_ttl_ms")]
    pub notification_ttl_ms: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_session_check_interval_ms")]
    pub session_check_interval_ms: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            session_file: default_session_file(),
            message_window: default_message_window(),
            min_password_length: default_min_password_length(),
            notification_ttl_ms: default_notification_ttl_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            session_check_interval_ms: default_session_check_interval_ms(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        if self.database_path.as_os_str().is_empty() {
            self.database_path = default_database_path();
        }
        if self.session_file.as_os_str().is_empty() {
            self.session_file = default_session_file();
        }
        if self.message_window == 0 {
            self.message_window = DEFAULT_MESSAGE_WINDOW;
        }
        self.min_password_length = self.min_password_length.max(1);
        if self.notification_ttl_ms == 0 {
            self.notification_ttl_ms = DEFAULT_NOTIFICATION_TTL_MS;
        }
        if self.reconnect_initial_ms == 0 {
            self.reconnect_initial_ms = DEFAULT_RECONNECT_INITIAL_MS;
        }
        // A cap below the first delay would shrink the backoff.
        self.reconnect_max_ms = self.reconnect_max_ms.max(self.reconnect_initial_ms);
        if self.session_check_interval_ms == 0 {
            self.session_check_interval_ms = DEFAULT_SESSION_CHECK_INTERVAL_MS;
        }

        self
    }

    pub fn database_location(&self) -> String {
        self.database_path.display().to_string()
    }

    pub fn identity_config(&self) -> IdentityConfig {
        IdentityConfig::default()
            .with_min_password_length(self.min_password_length)
            .with_session_file(self.session_file.clone())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_millis(self.notification_ttl_ms)
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_millis(self.session_check_interval_ms)
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".firechat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_sources(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_sources(path: &Path) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".firechat"))
}

fn default_database_path() -> PathBuf {
    default_data_dir().join(DATABASE_FILE_NAME)
}

fn default_session_file() -> PathBuf {
    default_data_dir().join(SESSION_FILE_NAME)
}

fn default_message_window() -> usize {
    DEFAULT_MESSAGE_WINDOW
}

fn default_min_password_length() -> usize {
    DEFAULT_MIN_PASSWORD_LENGTH
}

fn default_notification_ttl_ms() -> u64 {
    DEFAULT_NOTIFICATION_TTL_MS
}

fn default_reconnect_initial_ms() -> u64 {
    DEFAULT_RECONNECT_INITIAL_MS
}

fn default_reconnect_max_ms() -> u64 {
    DEFAULT_RECONNECT_MAX_MS
}

fn default_session_check_interval_ms() -> u64 {
    DEFAULT_SESSION_CHECK_INTERVAL_MS
}
