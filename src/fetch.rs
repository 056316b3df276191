use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;

use crate::backoff::BackoffConfig;
use crate::exclusion::Exclusions;
use crate::extract::{self, FileKind, ModuleContents};
use crate::godoc;
use crate::gomod;
use crate::license::{self, Redistributability};
use crate::outcome::{ErrorKind, FetchCode, FetchError};
use crate::proxy::{check_module_path, ProxyClient};
use crate::record::{LicenseFinding, ModuleRecord, ModuleVersion, Package, Readme, SourceInfo};
use crate::store::Store;
use crate::util::Scope;
use crate::version;

/// How long the status write of a failed attempt may take; it runs on its
/// own budget so an expired task deadline cannot lose the 499 row.
const STATUS_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal result of one fetch attempt.
#[derive(Clone, Debug)]
pub struct FetchOutcome {
    /// Identity the attempt resolved to (canonical version).
    pub id: ModuleVersion,
    pub code: FetchCode,
    pub kind: ErrorKind,
    pub message: String,
    /// `Some` when the queue should redeliver after this delay.
    pub retry_delay: Option<Duration>,
}

/// Orchestrates one `(module, version)` ingestion end to end: proxy
/// artifacts in, module record out, exactly one outcome code per attempt.
pub struct Fetcher {
    proxy: Arc<ProxyClient>,
    store: Arc<Store>,
    exclusions: Arc<Exclusions>,
    backoff: BackoffConfig,
}

impl Fetcher {
    pub fn new(
        proxy: Arc<ProxyClient>,
        store: Arc<Store>,
        exclusions: Arc<Exclusions>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            proxy,
            store,
            exclusions,
            backoff,
        }
    }

    /// Run the pipeline and persist the outcome: content and status for
    /// successes (one transaction), status only for failures. Internal
    /// panics become `Internal` outcomes rather than escaping the worker.
    #[tracing::instrument(skip(self, scope), fields(module = %id))]
    pub async fn fetch_and_record(
        &self,
        id: &ModuleVersion,
        app_label: &str,
        attempt: u32,
        scope: &Scope,
    ) -> FetchOutcome {
        let started_at = Utc::now();
        let mut resolved = id.clone();

        let result = std::panic::AssertUnwindSafe(self.run(
            &mut resolved,
            app_label,
            scope,
            started_at,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic".into());
            Err(FetchError::Internal(format!("panic: {msg}")))
        });

        let outcome = match result {
            Ok(code) => {
                // Canonicalization is informational, not an error.
                let (kind, message) = if resolved.version != id.version {
                    (
                        ErrorKind::Canonicalized,
                        format!("canonicalized from {}", id.version),
                    )
                } else {
                    (ErrorKind::None, String::new())
                };
                FetchOutcome {
                    id: resolved.clone(),
                    code,
                    kind,
                    message,
                    retry_delay: None,
                }
            }
            Err(err) => {
                let kind = err.kind();
                let retry_delay = kind.is_retryable().then(|| self.backoff.delay(attempt));
                FetchOutcome {
                    id: resolved.clone(),
                    code: err.code(),
                    kind,
                    message: err.bounded_message(),
                    retry_delay,
                }
            }
        };

        // Success rows are written inside the upsert transaction, and a
        // 299 must not displace the good row it defers to.
        let needs_status_row = !matches!(
            outcome.code,
            FetchCode::Ok | FetchCode::OkNoPackages | FetchCode::AlreadyHave
        );
        if needs_status_row {
            let next_eligible = outcome
                .retry_delay
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| Utc::now() + d);
            let write = self.store.set_status(
                &outcome.id,
                outcome.code,
                outcome.kind,
                &outcome.message,
                app_label,
                next_eligible,
            );
            match tokio::time::timeout(STATUS_WRITE_TIMEOUT, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(module = %outcome.id, error = %e, "status write failed")
                }
                Err(_) => {
                    tracing::error!(module = %outcome.id, "status write timed out")
                }
            }
        }

        outcome
    }

    async fn run(
        &self,
        id: &mut ModuleVersion,
        app_label: &str,
        scope: &Scope,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<FetchCode, FetchError> {
        check_module_path(&id.module_path)?;
        if self.exclusions.covers(&id.module_path, Some(&id.version)).await {
            return Err(FetchError::Excluded);
        }
        if scope
            .run(self.store.has_good_version(id, app_label))
            .await?
        {
            return Ok(FetchCode::AlreadyHave);
        }

        // Canonicalize through the proxy; proceed under the canonical form.
        let info = self
            .proxy
            .info(&id.module_path, &id.version, scope)
            .await?;
        let canonical = version::canonical(&info.version)
            .map_err(|e| FetchError::Invalid(e.to_string()))?;
        if canonical != id.version {
            tracing::info!(
                module = %id.module_path,
                requested = %id.version,
                canonical = %canonical,
                "canonicalized version"
            );
            id.version = canonical;
            if self.exclusions.covers(&id.module_path, Some(&id.version)).await {
                return Err(FetchError::Excluded);
            }
            if scope
                .run(self.store.has_good_version(id, app_label))
                .await?
            {
                return Ok(FetchCode::AlreadyHave);
            }
        }
        let commit_time = info
            .time
            .ok_or_else(|| FetchError::Invalid("proxy .info has no commit time".into()))?;

        // go.mod gates the rest: a module the proxy knows but cannot give
        // a go.mod for is malformed, not missing.
        let go_mod_bytes = match self.proxy.go_mod(&id.module_path, &id.version, scope).await {
            Ok(bytes) => bytes,
            Err(crate::proxy::ProxyError::NotFound) => {
                return Err(FetchError::Invalid("go.mod missing".into()))
            }
            Err(e) => return Err(e.into()),
        };
        let go_mod = gomod::parse(&go_mod_bytes)?;
        if go_mod.module_path != id.module_path {
            return Err(FetchError::Invalid(format!(
                "go.mod declares module {}, expected {}",
                go_mod.module_path, id.module_path
            )));
        }
        if go_mod.is_retracted(&id.version) {
            return Err(FetchError::Excluded);
        }

        let zip_bytes = self.proxy.zip(&id.module_path, &id.version, scope).await?;
        scope.check()?;

        // Unpacking and parsing are CPU-bound; they run off the async
        // threads in one blocking region.
        let module_path = id.module_path.clone();
        let ver = id.version.clone();
        let derived = tokio::task::spawn_blocking(move || {
            let contents = extract::extract_module(&zip_bytes, &module_path, &ver)?;
            Ok::<_, FetchError>(derive_contents(&module_path, contents))
        })
        .await
        .map_err(|e| FetchError::Internal(format!("extraction task failed: {e}")))??;
        scope.check()?;

        let Derived {
            licenses,
            redist,
            packages,
            readme,
        } = derived;

        let code = if packages.iter().all(|p| p.name.is_empty()) {
            FetchCode::OkNoPackages
        } else {
            FetchCode::Ok
        };

        let record = ModuleRecord {
            id: id.clone(),
            commit_time,
            go_mod: go_mod_bytes.to_vec(),
            has_go_mod: true,
            redistributable: redist.module_redistributable(),
            packages,
            licenses,
            readme: redist.module_redistributable().then_some(readme).flatten(),
            source_info: derive_source_info(&id.module_path, &id.version),
        };

        match scope
            .run(self
                .store
                .upsert_module(&record, code, app_label, started_at))
            .await
        {
            Ok(()) => Ok(code),
            Err(FetchError::DbConflict) => {
                // One immediate retry: if the concurrent writer produced a
                // good record we defer to it, otherwise try once more.
                if scope
                    .run(self.store.has_good_version(id, app_label))
                    .await?
                {
                    return Ok(FetchCode::AlreadyHave);
                }
                match scope
                    .run(self
                        .store
                        .upsert_module(&record, code, app_label, started_at))
                    .await
                {
                    Ok(()) => Ok(code),
                    Err(FetchError::DbConflict) => Err(FetchError::Transient(
                        "repeated conflict on module upsert".into(),
                    )),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

struct Derived {
    licenses: Vec<LicenseFinding>,
    redist: Redistributability,
    packages: Vec<Package>,
    readme: Option<Readme>,
}

fn derive_contents(module_path: &str, contents: ModuleContents) -> Derived {
    let licenses = license::detect_all(
        contents
            .of_kind(FileKind::License)
            .map(|f| (f.path.clone(), f.contents.clone())),
    );
    let redist = Redistributability::from_findings(&licenses);

    let packages = godoc::extract_packages(module_path, &contents, &redist);

    // Root readme only; deeper ones belong to the render layer.
    let readme = contents
        .of_kind(FileKind::Readme)
        .find(|f| !f.path.contains('/'))
        .map(|f| Readme {
            file_path: f.path.clone().into(),
            contents: f.contents.clone(),
        });

    Derived {
        licenses,
        redist,
        packages,
        readme,
    }
}

/// Deep-link information for well-known hosts; everything else gets none.
fn derive_source_info(module_path: &str, version: &str) -> Option<SourceInfo> {
    let mut segments = module_path.split('/');
    let host = segments.next()?;

    match host {
        "github.com" | "gitlab.com" | "bitbucket.org" => {
            let owner = segments.next()?;
            let repo = segments.next()?;
            let directory = segments.collect::<Vec<_>>().join("/");
            Some(SourceInfo {
                repo_url: format!("https://{host}/{owner}/{repo}"),
                revision: version.to_string(),
                directory,
            })
        }
        "golang.org" => {
            let x = segments.next()?;
            if x != "x" {
                return None;
            }
            let repo = segments.next()?;
            let directory = segments.collect::<Vec<_>>().join("/");
            Some(SourceInfo {
                repo_url: format!("https://go.googlesource.com/{repo}"),
                revision: version.to_string(),
                directory,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_info_for_known_hosts() {
        let info = derive_source_info("github.com/user/repo/sub/pkg", "v1.2.3").unwrap();
        assert_eq!(info.repo_url, "https://github.com/user/repo");
        assert_eq!(info.revision, "v1.2.3");
        assert_eq!(info.directory, "sub/pkg");

        let info = derive_source_info("golang.org/x/sync", "v0.5.0").unwrap();
        assert_eq!(info.repo_url, "https://go.googlesource.com/sync");
        assert_eq!(info.directory, "");

        assert!(derive_source_info("example.com/a", "v1.0.0").is_none());
        assert!(derive_source_info("golang.org/y/thing", "v1.0.0").is_none());
    }
}
