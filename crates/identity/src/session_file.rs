use std::path::{Path, PathBuf};

use firechat_storage::SessionTokenId;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::provider::{AuthResult, SessionEncodingSnafu, SessionFileSnafu};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredSession {
    token: SessionTokenId,
}

/// On-disk slot for the current session token.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted token. Missing or unreadable content counts as no session.
    pub fn load(&self) -> AuthResult<Option<SessionTokenId>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(source).context(SessionFileSnafu {
                    stage: "session-file-read",
                    path: self.path.clone(),
                });
            }
        };

        let token = serde_json::from_str::<StoredSession>(&content)
            .ok()
            .map(|stored| stored.token);
        if token.is_none() {
            tracing::warn!(path = ?self.path, "ignoring malformed session file");
        }

        Ok(token)
    }

    pub fn store(&self, token: SessionTokenId) -> AuthResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(SessionFileSnafu {
                stage: "session-file-create-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content =
            serde_json::to_string(&StoredSession { token }).context(SessionEncodingSnafu {
                stage: "session-file-encode",
            })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(SessionFileSnafu {
            stage: "session-file-write-temporary",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &self.path).context(SessionFileSnafu {
            stage: "session-file-rename",
            path: self.path.clone(),
        })?;

        Ok(())
    }

    pub fn clear(&self) -> AuthResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(SessionFileSnafu {
                stage: "session-file-remove",
                path: self.path.clone(),
            }),
        }
    }
}
