use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("I/O error on credential file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential file {path} is not valid JSON: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Bearer credential plus the identity it authenticates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub token: String,
    pub user_id: String,
}

impl Credential {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Shared, observable holder of the current credential.
///
/// Every clone observes the same value. The authentication subsystem sets
/// it; a 401 anywhere clears it; the push channel follows it through
/// [`CredentialHandle::subscribe`].
#[derive(Clone)]
pub struct CredentialHandle {
    sender: Arc<watch::Sender<Option<Credential>>>,
}

impl CredentialHandle {
    pub fn new(initial: Option<Credential>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn empty() -> Self {
        Self::new(None)
    }

    pub fn get(&self) -> Option<Credential> {
        self.sender.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub fn set(&self, credential: Credential) {
        info!(user_id = %credential.user_id, "credential set");
        self.sender.send_replace(Some(credential));
    }

    /// Returns whether a credential was actually removed.
    pub fn clear(&self) -> bool {
        let previous = self.sender.send_replace(None);
        if previous.is_some() {
            info!("credential cleared");
            true
        } else {
            debug!("credential already clear");
            false
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.sender.subscribe()
    }
}

impl Default for CredentialHandle {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

/// Return the platform-appropriate credential file path.
#[cfg(feature = "native")]
pub fn credential_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "pairlink", "pairlink") {
        proj_dirs.data_dir().join("credential.json")
    } else {
        PathBuf::from("credential.json")
    }
}

/// Load a persisted credential. A missing file means "not logged in".
pub fn load_credential(path: &Path) -> Result<Option<Credential>, CredentialError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CredentialError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| CredentialError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

pub fn save_credential(path: &Path, credential: &Credential) -> Result<(), CredentialError> {
    let io_error = |source: std::io::Error| CredentialError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let json = serde_json::to_string_pretty(credential).map_err(|source| {
        CredentialError::Malformed {
            path: path.to_path_buf(),
            source,
        }
    })?;
    std::fs::write(path, json).map_err(io_error)
}

pub fn remove_credential(path: &Path) -> Result<(), CredentialError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CredentialError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
