//! Target user resolution
//!
//! A session runs on behalf of one user. Resolving the user yields the root of
//! that user's external storage, under which restricted-mode directories live.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a platform user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum UserLookupError {
    #[error("User {0} not found")]
    NotFound(UserId),

    #[error("I/O error resolving user {user}: {source}")]
    Io {
        user: UserId,
        #[source]
        source: std::io::Error,
    },
}

/// A resolved user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user: UserId,
    /// Root of the user's external storage.
    pub external_root: PathBuf,
}

impl UserContext {
    /// Path of a public directory (e.g. `DCIM`) in the user's external storage.
    pub fn public_dir(&self, name: &str) -> PathBuf {
        self.external_root.join(name)
    }
}

/// Resolves a user id to its storage context.
pub trait UserResolver: Send + Sync {
    fn resolve(&self, user: UserId) -> Result<UserContext, UserLookupError>;
}

/// Resolves users to `<base>/<id>`, which must already exist as a directory.
#[derive(Debug, Clone)]
pub struct FsUserResolver {
    base: PathBuf,
}

impl FsUserResolver {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }
}

impl UserResolver for FsUserResolver {
    fn resolve(&self, user: UserId) -> Result<UserContext, UserLookupError> {
        let root = self.base.join(user.to_string());
        match std::fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => Ok(UserContext {
                user,
                external_root: root,
            }),
            Ok(_) => Err(UserLookupError::NotFound(user)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(UserLookupError::NotFound(user))
            }
            Err(source) => Err(UserLookupError::Io { user, source }),
        }
    }
}
