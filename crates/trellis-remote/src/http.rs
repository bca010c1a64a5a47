//! HTTP object store backend.

use async_trait::async_trait;
use tracing::debug;
use trellis_core::Digest;

use crate::error::{RemoteError, Result};
use crate::Remote;

/// Remote speaking plain HTTP against an object store.
///
/// The server needs three verbs under `<base>/objects/`: `HEAD` to
/// probe, `PUT` to upload, `GET` to download. Any static file server
/// with uploads enabled qualifies. When a token is configured it is
/// sent as a bearer Authorization header.
pub struct HttpRemote {
    base: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("trellis/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
            token,
        })
    }

    fn object_url(&self, digest: &Digest) -> String {
        let hex = digest.to_hex();
        format!("{}/objects/{}/{}", self.base, &hex[..2], &hex[2..])
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Remote for HttpRemote {
    fn location(&self) -> String {
        self.base.clone()
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        let url = self.object_url(digest);
        let response = self.authorize(self.client.head(&url)).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            Err(RemoteError::Http(format!("HEAD {url} returned {status}")))
        }
    }

    async fn push(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let url = self.object_url(digest);
        debug!(url = %url, bytes = data.len(), "uploading object");

        let response = self
            .authorize(self.client.put(&url))
            .body(data.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Http(format!("PUT {url} returned {status}")));
        }
        Ok(())
    }

    async fn pull(&self, digest: &Digest) -> Result<Vec<u8>> {
        let url = self.object_url(digest);
        debug!(url = %url, "downloading object");

        let response = self.authorize(self.client.get(&url)).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(response.bytes().await?.to_vec())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(RemoteError::ObjectMissing(digest.to_hex()))
        } else {
            Err(RemoteError::Http(format!("GET {url} returned {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_its_trailing_slash() {
        let remote = HttpRemote::new("https://artifacts.example.com/proj/", None).unwrap();
        assert_eq!(remote.location(), "https://artifacts.example.com/proj");
    }

    #[test]
    fn object_urls_are_sharded_like_the_cache() {
        let remote = HttpRemote::new("https://artifacts.example.com/proj", None).unwrap();
        let digest = Digest::compute(b"model.bin");
        let hex = digest.to_hex();

        let url = remote.object_url(&digest);
        assert_eq!(
            url,
            format!(
                "https://artifacts.example.com/proj/objects/{}/{}",
                &hex[..2],
                &hex[2..]
            )
        );
    }
}
