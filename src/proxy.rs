use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tap::Pipe;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::outcome::FetchError;
use crate::util::{decode_json, Scope};

/// Compressed size cap for a module archive.
pub const MAX_ZIP_COMPRESSED: u64 = 100 * 1024 * 1024;
/// Size cap for a go.mod file.
pub const MAX_GO_MOD: u64 = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("module or version not found upstream")]
    NotFound,

    #[error("invalid module path or version: {0}")]
    Invalid(String),

    #[error("{0}")]
    TooLarge(String),

    #[error("proxy request failed: {0}")]
    Transient(String),

    #[error("proxy request timed out")]
    Timeout,
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::Timeout
        } else {
            ProxyError::Transient(e.to_string())
        }
    }
}

impl From<ProxyError> for FetchError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::NotFound => FetchError::NotFound("proxy".into()),
            ProxyError::Invalid(m) => FetchError::Invalid(m),
            ProxyError::TooLarge(m) => FetchError::TooLarge(m),
            ProxyError::Transient(m) => FetchError::Transient(m),
            ProxyError::Timeout => FetchError::Timeout,
        }
    }
}

/// `.info` payload for one version.
#[derive(Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct VersionInfo {
    #[serde(rename = "Version")]
    pub version: CompactString,
    #[serde(rename = "Time")]
    pub time: Option<DateTime<Utc>>,
}

/// Escape a module path or version for proxy URLs: each upper-case letter
/// becomes `!` followed by its lower-case form.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 8);
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Reject module paths the proxy scheme cannot express safely.
pub fn check_module_path(path: &str) -> Result<(), ProxyError> {
    let bad = path.is_empty()
        || !path.contains('.')
        || path.starts_with('/')
        || path.ends_with('/')
        || path.contains("//")
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        || path
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || "-._~+/".contains(c)));
    if bad {
        return Err(ProxyError::Invalid(format!("bad module path: {path}")));
    }
    Ok(())
}

/// Client for the upstream module proxy.
///
/// Retries are owned by the queue and fetcher; this client reports each
/// failure exactly once, with `NotFound` kept distinct from transient
/// failures. Concurrency against the proxy host is bounded by a semaphore
/// independent of the worker count.
pub struct ProxyClient {
    client: reqwest::Client,
    base: Url,
    host_limit: Arc<Semaphore>,
}

impl ProxyClient {
    pub fn new(client: reqwest::Client, base: Url, host_limit: usize) -> Self {
        Self {
            client,
            base,
            host_limit: Arc::new(Semaphore::new(host_limit)),
        }
    }

    fn url(&self, escaped_module: &str, suffix: &str) -> Result<Url, ProxyError> {
        format!("{}/{}/{}", self.base.as_str().trim_end_matches('/'), escaped_module, suffix)
            .pipe(|u| Url::parse(&u))
            .map_err(|e| ProxyError::Invalid(e.to_string()))
    }

    /// The returned permit must outlive the body read so the per-host cap
    /// covers the transfer, not just the request.
    async fn get(
        &self,
        url: Url,
        scope: &Scope,
    ) -> Result<(reqwest::Response, OwnedSemaphorePermit), ProxyError> {
        let budget = scope.remaining().map_err(|_| ProxyError::Timeout)?;
        let permit = tokio::select! {
            p = self.host_limit.clone().acquire_owned() => {
                p.map_err(|_| ProxyError::Transient("proxy limiter closed".into()))?
            }
            _ = tokio::time::sleep(budget) => return Err(ProxyError::Timeout),
        };

        let budget = scope.remaining().map_err(|_| ProxyError::Timeout)?;
        let res = self.client.get(url).timeout(budget).send().await?;

        match res.status() {
            s if s.is_success() => Ok((res, permit)),
            // 410 Gone means the version list knows it but the proxy cannot
            // serve it; callers treat both the same way.
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(ProxyError::NotFound),
            s if s.is_server_error() => {
                Err(ProxyError::Transient(format!("proxy returned {s}")))
            }
            s => Err(ProxyError::Invalid(format!("proxy returned {s}"))),
        }
    }

    /// Read a response body with a hard byte cap, observing the scope
    /// between chunks.
    async fn bounded_body(
        &self,
        res: reqwest::Response,
        cap: u64,
        what: &str,
        scope: &Scope,
    ) -> Result<Bytes, ProxyError> {
        if let Some(len) = res.content_length() {
            if len > cap {
                return Err(ProxyError::TooLarge(format!(
                    "{what} is {len} bytes (cap {cap})"
                )));
            }
        }

        let mut buf = BytesMut::new();
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            scope.check().map_err(|_| ProxyError::Timeout)?;
            let chunk = chunk?;
            if buf.len() as u64 + chunk.len() as u64 > cap {
                return Err(ProxyError::TooLarge(format!(
                    "{what} exceeds {cap} bytes"
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Resolve `(module, version)` to its canonical version and commit time.
    #[tracing::instrument(skip(self, scope))]
    pub async fn info(
        &self,
        module: &str,
        version: &str,
        scope: &Scope,
    ) -> Result<VersionInfo, ProxyError> {
        check_module_path(module)?;
        let url = self.url(
            &escape_path(module),
            &format!("@v/{}.info", escape_path(version)),
        )?;
        let (res, _permit) = self.get(url, scope).await?;
        let body = self.bounded_body(res, 64 * 1024, ".info", scope).await?;
        decode_json(&body).map_err(|e| ProxyError::Invalid(format!("bad .info: {e}")))
    }

    /// Resolve a module's latest published version.
    #[tracing::instrument(skip(self, scope))]
    pub async fn latest(&self, module: &str, scope: &Scope) -> Result<VersionInfo, ProxyError> {
        check_module_path(module)?;
        let url = self.url(&escape_path(module), "@latest")?;
        let (res, _permit) = self.get(url, scope).await?;
        let body = self.bounded_body(res, 64 * 1024, "@latest", scope).await?;
        decode_json(&body).map_err(|e| ProxyError::Invalid(format!("bad @latest: {e}")))
    }

    /// Fetch the raw go.mod for a version.
    #[tracing::instrument(skip(self, scope))]
    pub async fn go_mod(
        &self,
        module: &str,
        version: &str,
        scope: &Scope,
    ) -> Result<Bytes, ProxyError> {
        check_module_path(module)?;
        let url = self.url(
            &escape_path(module),
            &format!("@v/{}.mod", escape_path(version)),
        )?;
        let (res, _permit) = self.get(url, scope).await?;
        self.bounded_body(res, MAX_GO_MOD, "go.mod", scope).await
    }

    /// Fetch the module archive, bounded by the compressed-size cap. The
    /// uncompressed cap is enforced during extraction.
    #[tracing::instrument(skip(self, scope))]
    pub async fn zip(
        &self,
        module: &str,
        version: &str,
        scope: &Scope,
    ) -> Result<Bytes, ProxyError> {
        check_module_path(module)?;
        let url = self.url(
            &escape_path(module),
            &format!("@v/{}.zip", escape_path(version)),
        )?;
        let (res, _permit) = self.get(url, scope).await?;
        self.bounded_body(res, MAX_ZIP_COMPRESSED, "module zip", scope)
            .await
    }
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn escaping() {
        assert_eq!(
            escape_path("github.com/BurntSushi/toml"),
            "github.com/!burnt!sushi/toml"
        );
        assert_eq!(escape_path("golang.org/x/sync"), "golang.org/x/sync");
        assert_eq!(escape_path("v1.2.3-RC1"), "v1.2.3-!r!c1");
    }

    #[test]
    fn path_validation() {
        assert!(check_module_path("example.com/a").is_ok());
        assert!(check_module_path("github.com/a-b/c_d.e~f").is_ok());
        assert_matches!(check_module_path(""), Err(ProxyError::Invalid(_)));
        assert_matches!(check_module_path("/leading"), Err(ProxyError::Invalid(_)));
        assert_matches!(
            check_module_path("example.com/../etc"),
            Err(ProxyError::Invalid(_))
        );
        assert_matches!(
            check_module_path("example.com//a"),
            Err(ProxyError::Invalid(_))
        );
        assert_matches!(
            check_module_path("example.com/a b"),
            Err(ProxyError::Invalid(_))
        );
        assert_matches!(check_module_path("nodots"), Err(ProxyError::Invalid(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn live_info() {
        let client = ProxyClient::new(
            reqwest::Client::new(),
            Url::parse("https://proxy.golang.org").unwrap(),
            10,
        );
        let scope = Scope::with_timeout(std::time::Duration::from_secs(30));
        let info = client
            .info("github.com/gin-gonic/gin", "v1.9.1", &scope)
            .await
            .unwrap();
        assert_eq!(info.version, "v1.9.1");
    }
}
