//! Remote selection: which url to use and which backend speaks it.

use trellis_core::Workspace;

use crate::error::{RemoteError, Result};
use crate::fs::LocalDirRemote;
use crate::http::HttpRemote;
use crate::Remote;

/// Environment variable overriding the workspace remote url.
pub const REMOTE_ENV: &str = "TRELLIS_REMOTE";

/// Environment variable carrying a bearer token for HTTP remotes.
pub const TOKEN_ENV: &str = "TRELLIS_REMOTE_TOKEN";

/// Resolved remote settings for one invocation.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub token: Option<String>,
}

impl RemoteConfig {
    /// Pick the remote url. An explicit flag wins, then `TRELLIS_REMOTE`,
    /// then `remote.url` from the workspace config.
    pub fn resolve(explicit: Option<&str>, workspace: &Workspace) -> Result<Self> {
        let url = match explicit {
            Some(url) => Some(url.to_string()),
            None => match env_var(REMOTE_ENV) {
                Some(url) => Some(url),
                None => workspace.config()?.remote.map(|remote| remote.url),
            },
        };

        Ok(Self {
            url: url.ok_or(RemoteError::NotConfigured)?,
            token: env_var(TOKEN_ENV),
        })
    }

    /// Open the backend this url names.
    pub fn open(&self) -> Result<Box<dyn Remote>> {
        open_remote(&self.url, self.token.clone())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Build a backend for `url`.
///
/// `http://` and `https://` urls talk to an HTTP object store. A
/// `file://` url or a bare filesystem path uses a local directory.
/// Any other scheme is rejected.
pub fn open_remote(url: &str, token: Option<String>) -> Result<Box<dyn Remote>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(HttpRemote::new(url, token)?));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Box::new(LocalDirRemote::new(path)?));
    }
    if url.contains("://") {
        return Err(RemoteError::UnsupportedUrl(url.to_string()));
    }
    Ok(Box::new(LocalDirRemote::new(url)?))
}
