use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::outcome::FetchError;

/// Decode JSON with path-aware errors, so a malformed upstream response
/// names the field that failed.
pub fn decode_json<T: DeserializeOwned>(
    x: &[u8],
) -> Result<T, serde_path_to_error::Error<serde_json::Error>> {
    let jd = &mut serde_json::Deserializer::from_slice(x);

    serde_path_to_error::deserialize(jd)
}

/// Deadline and cancel signal carried through one fetch attempt.
///
/// Every suspension point observes this scope rather than an ambient
/// timeout: callers derive per-request budgets from `remaining` and abort
/// early once either the deadline passes or the token fires.
#[derive(Clone, Debug)]
pub struct Scope {
    deadline: Instant,
    token: CancellationToken,
}

impl Scope {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Budget left, or the `Timeout` outcome once expired or cancelled.
    pub fn remaining(&self) -> Result<Duration, FetchError> {
        if self.token.is_cancelled() {
            return Err(FetchError::Timeout);
        }
        let now = Instant::now();
        if now >= self.deadline {
            return Err(FetchError::Timeout);
        }
        Ok(self.deadline - now)
    }

    pub fn check(&self) -> Result<(), FetchError> {
        self.remaining().map(|_| ())
    }

    /// Run a future under this scope, converting expiry into `Timeout`.
    pub async fn run<T, E>(
        &self,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<T, FetchError>
    where
        FetchError: From<E>,
    {
        let budget = self.remaining()?;
        tokio::select! {
            _ = self.token.cancelled() => Err(FetchError::Timeout),
            out = tokio::time::timeout(budget, fut) => match out {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(FetchError::Timeout),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn scope_expires() {
        let scope = Scope::with_timeout(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_matches!(scope.remaining(), Err(FetchError::Timeout));
    }

    #[tokio::test]
    async fn scope_cancels_running_future() {
        let scope = Scope::with_timeout(Duration::from_secs(60));
        let inner = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            inner.cancel();
        });
        let out: Result<(), FetchError> = scope
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), FetchError>(())
            })
            .await;
        assert_matches!(out, Err(FetchError::Timeout));
    }

    #[tokio::test]
    async fn scope_propagates_inner_error() {
        let scope = Scope::with_timeout(Duration::from_secs(1));
        let out: Result<(), FetchError> = scope
            .run(async { Err::<(), FetchError>(FetchError::Excluded) })
            .await;
        assert_matches!(out, Err(FetchError::Excluded));
    }
}
