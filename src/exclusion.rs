use std::sync::Arc;
use std::time::Duration;

use compact_str::{CompactString, ToCompactString};
use rustc_hash::FxHashSet;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::record::ExclusionEntry;
use crate::store::Store;

/// Matcher over one generation of exclusion entries.
///
/// Path prefixes are kept sorted for binary-search lookups; exact
/// `module@version` entries are a hash set.
#[derive(Default, Debug)]
pub struct ExclusionSet {
    prefixes: Vec<CompactString>,
    exact: FxHashSet<CompactString>,
}

impl ExclusionSet {
    pub fn build(entries: impl IntoIterator<Item = ExclusionEntry>) -> Self {
        let mut prefixes = Vec::new();
        let mut exact = FxHashSet::default();
        for entry in entries {
            if entry.prefix.contains('@') {
                exact.insert(entry.prefix);
            } else {
                prefixes.push(entry.prefix);
            }
        }
        prefixes.sort();
        prefixes.dedup();
        Self { prefixes, exact }
    }

    pub fn covers(&self, module_path: &str, version: Option<&str>) -> bool {
        if let Some(v) = version {
            if self.exact.contains(format!("{module_path}@{v}").as_str()) {
                return true;
            }
        }
        // Check every '/'-boundary ancestor of the path, each by binary
        // search, so lookups stay logarithmic.
        let mut candidate = module_path;
        loop {
            if self
                .prefixes
                .binary_search_by(|p| p.as_str().cmp(candidate))
                .is_ok()
            {
                return true;
            }
            match candidate.rsplit_once('/') {
                Some((head, _)) => candidate = head,
                None => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.prefixes.len() + self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared exclusion registry: a cached [`ExclusionSet`] rebuilt from the
/// store at start and refreshed periodically.
#[derive(Debug)]
pub struct Exclusions {
    set: RwLock<ExclusionSet>,
}

impl Exclusions {
    pub fn new(set: ExclusionSet) -> Self {
        Self {
            set: RwLock::new(set),
        }
    }

    pub async fn covers(&self, module_path: &str, version: Option<&str>) -> bool {
        self.set.read().await.covers(module_path, version)
    }

    pub async fn replace(&self, set: ExclusionSet) {
        *self.set.write().await = set;
    }

    /// Periodically rebuild the cache from the store until shutdown.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        store: Arc<Store>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match store.load_exclusions().await {
                    Ok(entries) => {
                        let set = ExclusionSet::build(entries);
                        tracing::debug!(entries = set.len(), "exclusion cache refreshed");
                        this.replace(set).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "exclusion refresh failed"),
                }
            }
        })
    }
}

/// Parse the bootstrap exclusion file: `<prefix> <reason>` per line, with
/// blank lines and `#` comments ignored.
pub fn parse_bootstrap(text: &str) -> Vec<(CompactString, String)> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let (prefix, reason) = match l.split_once(char::is_whitespace) {
                Some((p, r)) => (p, r.trim()),
                None => (l, ""),
            };
            if prefix.is_empty() {
                None
            } else {
                Some((prefix.to_compact_string(), reason.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(prefix: &str) -> ExclusionEntry {
        ExclusionEntry {
            prefix: prefix.into(),
            reason: "test".into(),
            author: "admin".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn prefix_and_exact_matching() {
        let set = ExclusionSet::build([
            entry("example.com/bad"),
            entry("example.com/worse/deep"),
            entry("example.com/a@v1.2.3"),
        ]);

        assert!(set.covers("example.com/bad", None));
        assert!(set.covers("example.com/bad/x/y", Some("v1.0.0")));
        assert!(!set.covers("example.com/badge", None));
        assert!(set.covers("example.com/worse/deep/z", None));
        assert!(!set.covers("example.com/worse", None));

        assert!(set.covers("example.com/a", Some("v1.2.3")));
        assert!(!set.covers("example.com/a", Some("v1.2.4")));
        assert!(!set.covers("example.com/a", None));
    }

    #[test]
    fn bootstrap_format() {
        let text = "# comment\n\nexample.com/bad spam and abuse\nexample.com/a@v1.0.0 dmca\nlonely\n";
        let parsed = parse_bootstrap(text);
        assert_eq!(
            parsed,
            vec![
                ("example.com/bad".into(), "spam and abuse".to_string()),
                ("example.com/a@v1.0.0".into(), "dmca".to_string()),
                ("lonely".into(), String::new()),
            ]
        );
    }
}
