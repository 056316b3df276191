use rustc_hash::FxHashSet;
use thiserror::Error;
use url::Url;

use crate::record::{IndexCursor, IndexEntry};
use crate::util::{decode_json, Scope};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index request failed: {0}")]
    Transient(String),

    #[error("index request timed out")]
    Timeout,
}

impl From<reqwest::Error> for IndexError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            IndexError::Timeout
        } else {
            IndexError::Transient(e.to_string())
        }
    }
}

/// Client for the upstream index: a newline-delimited JSON stream of
/// `(module, version, timestamp)` records ordered by timestamp.
pub struct IndexClient {
    client: reqwest::Client,
    base: Url,
}

impl IndexClient {
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }

    /// Fetch up to `limit` records after `cursor`.
    ///
    /// The result is ascending by timestamp and deduplicated by
    /// `(module, version)`. A malformed record is logged and skipped, and
    /// the cursor still advances past it when its timestamp is readable,
    /// so one bad record cannot block the stream.
    #[tracing::instrument(skip(self, cursor, scope))]
    pub async fn since(
        &self,
        cursor: &IndexCursor,
        limit: usize,
        scope: &Scope,
    ) -> Result<(Vec<IndexEntry>, IndexCursor), IndexError> {
        let mut url = self.base.clone();
        {
            let mut q = url.query_pairs_mut();
            if let Some(ts) = cursor.last_seen_timestamp {
                q.append_pair("since", &ts.to_rfc3339());
            }
            q.append_pair("limit", &limit.to_string());
        }

        let budget = scope.remaining().map_err(|_| IndexError::Timeout)?;
        let res = self
            .client
            .get(url)
            .timeout(budget)
            .send()
            .await?
            .error_for_status()?;
        let body = res.bytes().await?;

        Ok(parse_body(&body, cursor))
    }
}

fn parse_body(body: &[u8], cursor: &IndexCursor) -> (Vec<IndexEntry>, IndexCursor) {
    let mut out = Vec::new();
    let mut seen: FxHashSet<(_, _)> = FxHashSet::default();
    let mut next = cursor.clone();

    for line in body.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        match decode_json::<IndexEntry>(line) {
            Ok(entry) => {
                // The cursor is exclusive; re-served boundary records are
                // dropped here rather than re-enqueued.
                if cursor
                    .last_seen_timestamp
                    .is_some_and(|ts| entry.timestamp < ts)
                {
                    continue;
                }
                next.advance(&entry);
                if seen.insert((entry.module_path.clone(), entry.version.clone())) {
                    out.push(entry);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed index record");
                // Best effort: advance past the bad record by its timestamp
                // so it cannot block the head of the stream.
                if let Ok(v) = serde_json::from_slice::<serde_json::Value>(line) {
                    if let Some(ts) = v
                        .get("Timestamp")
                        .and_then(|t| t.as_str())
                        .and_then(|t| t.parse().ok())
                    {
                        if next.last_seen_timestamp.is_none_or(|prev| ts > prev) {
                            next.last_seen_timestamp = Some(ts);
                        }
                    }
                }
            }
        }
    }

    out.sort_by_key(|e| e.timestamp);
    (out, next)
}

impl std::fmt::Debug for IndexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexClient")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn dedup_and_order() {
        let body = concat!(
            r#"{"Path":"example.com/b","Version":"v1.0.0","Timestamp":"2024-01-02T00:00:01Z"}"#,
            "\n",
            r#"{"Path":"example.com/a","Version":"v1.0.0","Timestamp":"2024-01-02T00:00:00Z"}"#,
            "\n",
            r#"{"Path":"example.com/b","Version":"v1.0.0","Timestamp":"2024-01-02T00:00:02Z"}"#,
            "\n",
        );
        let (entries, next) = parse_body(body.as_bytes(), &IndexCursor::default());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].module_path, "example.com/a");
        assert_eq!(entries[1].module_path, "example.com/b");
        assert_eq!(
            next.last_seen_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 2).unwrap())
        );
        assert_eq!(next.last_seen_key.as_deref(), Some("example.com/b@v1.0.0"));
    }

    #[test]
    fn malformed_record_advances_cursor() {
        let body = concat!(
            r#"{"Path":"example.com/a","Version":"v1.0.0","Timestamp":"2024-01-02T00:00:00Z"}"#,
            "\n",
            r#"{"Path":12345,"Version":null,"Timestamp":"2024-01-02T00:00:05Z"}"#,
            "\n",
        );
        let (entries, next) = parse_body(body.as_bytes(), &IndexCursor::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(
            next.last_seen_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 5).unwrap())
        );
    }

    #[test]
    fn cursor_is_exclusive_of_older_records() {
        let cursor = IndexCursor {
            last_seen_timestamp: Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 1).unwrap()),
            last_seen_key: None,
        };
        let body =
            r#"{"Path":"example.com/old","Version":"v1.0.0","Timestamp":"2024-01-01T00:00:00Z"}"#;
        let (entries, _) = parse_body(body.as_bytes(), &cursor);
        assert!(entries.is_empty());
    }
}
