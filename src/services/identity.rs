//! Uploader identity and entitlement.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Identity used by the open directory.
pub const ANONYMOUS: &str = "anonymous";

/// An authenticated uploader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploader {
    /// Recipient of the job notification.
    pub name: String,
    /// Whether this uploader may submit conversions.
    pub entitled: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("missing or unknown credentials")]
    Unauthorized,
    #[error("malformed token entry `{0}`")]
    InvalidEntry(String),
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Resolve a bearer token to an uploader.
    async fn authenticate(&self, token: Option<&str>) -> Result<Uploader, IdentityError>;
}

/// Accepts every request as the entitled `anonymous` uploader.
#[derive(Debug, Default, Clone)]
pub struct OpenDirectory;

#[async_trait]
impl IdentityDirectory for OpenDirectory {
    async fn authenticate(&self, _token: Option<&str>) -> Result<Uploader, IdentityError> {
        Ok(Uploader {
            name: ANONYMOUS.to_string(),
            entitled: true,
        })
    }
}

/// Fixed token table loaded from configuration.
///
/// Entries look like `token=recipient`; a leading `!` on the recipient
/// (`token=!recipient`) registers a known but unentitled uploader.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    tokens: HashMap<String, Uploader>,
}

impl StaticDirectory {
    pub fn from_entries<I, S>(entries: I) -> Result<Self, IdentityError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tokens = HashMap::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let (token, recipient) = entry
                .split_once('=')
                .map(|(t, r)| (t.trim(), r.trim()))
                .filter(|(t, r)| !t.is_empty() && !r.is_empty())
                .ok_or_else(|| IdentityError::InvalidEntry(entry.to_string()))?;

            let uploader = match recipient.strip_prefix('!') {
                Some(name) => Uploader {
                    name: name.to_string(),
                    entitled: false,
                },
                None => Uploader {
                    name: recipient.to_string(),
                    entitled: true,
                },
            };
            tokens.insert(token.to_string(), uploader);
        }
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn authenticate(&self, token: Option<&str>) -> Result<Uploader, IdentityError> {
        token
            .and_then(|t| self.tokens.get(t))
            .cloned()
            .ok_or(IdentityError::Unauthorized)
    }
}
