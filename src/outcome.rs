use thiserror::Error;

/// Stable numeric outcome of one fetch attempt.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, serde::Serialize, serde::Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum FetchCode {
    /// Fetched and stored.
    Ok,
    /// Fetched, but the module contains no buildable packages.
    OkNoPackages,
    /// A good record under an equal-or-newer app label already exists.
    AlreadyHave,
    /// Malformed input: bad path, bad go.mod, mismatched module directive.
    Invalid,
    /// Covered by the exclusion registry (or retracted).
    Excluded,
    /// The proxy does not have this module or version.
    NotFound,
    /// A concurrent write for the same identity won.
    Conflict,
    /// A size cap was exceeded; only status is stored.
    TooLarge,
    /// The task deadline expired.
    Timeout,
    /// A bug or unclassified failure; requires manual requeue.
    Internal,
}

impl FetchCode {
    pub fn as_u16(self) -> u16 {
        match self {
            FetchCode::Ok => 200,
            FetchCode::OkNoPackages => 290,
            FetchCode::AlreadyHave => 299,
            FetchCode::Invalid => 400,
            FetchCode::Excluded => 403,
            FetchCode::NotFound => 404,
            FetchCode::Conflict => 409,
            FetchCode::TooLarge => 413,
            FetchCode::Timeout => 499,
            FetchCode::Internal => 500,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            200 => FetchCode::Ok,
            290 => FetchCode::OkNoPackages,
            299 => FetchCode::AlreadyHave,
            400 => FetchCode::Invalid,
            403 => FetchCode::Excluded,
            404 => FetchCode::NotFound,
            409 => FetchCode::Conflict,
            413 => FetchCode::TooLarge,
            499 => FetchCode::Timeout,
            500..=599 => FetchCode::Internal,
            _ => return None,
        })
    }

    /// Codes LatestView and `has_good_version` accept.
    pub fn is_good(self) -> bool {
        matches!(self, FetchCode::Ok | FetchCode::OkNoPackages)
    }
}

impl From<FetchCode> for u16 {
    fn from(code: FetchCode) -> u16 {
        code.as_u16()
    }
}

impl TryFrom<u16> for FetchCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, String> {
        FetchCode::from_u16(code).ok_or_else(|| format!("unknown fetch code {code}"))
    }
}

/// Classification of a failure, independent of its display text.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    None,
    NotFound,
    Invalid,
    TooLarge,
    Excluded,
    /// Informational: the requested version was not canonical.
    Canonicalized,
    Transient,
    Timeout,
    Internal,
    DbConflict,
}

impl ErrorKind {
    /// Whether the queue should redeliver after backoff. `Internal` is
    /// terminal despite its 5xx code; it needs a manual requeue.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Invalid => "invalid",
            ErrorKind::TooLarge => "too_large",
            ErrorKind::Excluded => "excluded",
            ErrorKind::Canonicalized => "canonicalized",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
            ErrorKind::DbConflict => "db_conflict",
        }
    }
}

/// The first error of a fetch pipeline; maps to exactly one outcome code.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid module: {0}")]
    Invalid(String),

    #[error("size cap exceeded: {0}")]
    TooLarge(String),

    #[error("module is excluded from ingestion")]
    Excluded,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("task deadline exceeded")]
    Timeout,

    #[error("concurrent write for the same module version")]
    DbConflict,

    #[error("internal: {0}")]
    Internal(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::NotFound(_) => ErrorKind::NotFound,
            FetchError::Invalid(_) => ErrorKind::Invalid,
            FetchError::TooLarge(_) => ErrorKind::TooLarge,
            FetchError::Excluded => ErrorKind::Excluded,
            FetchError::Transient(_) => ErrorKind::Transient,
            FetchError::Timeout => ErrorKind::Timeout,
            FetchError::DbConflict => ErrorKind::DbConflict,
            FetchError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> FetchCode {
        match self {
            FetchError::NotFound(_) => FetchCode::NotFound,
            FetchError::Invalid(_) => FetchCode::Invalid,
            FetchError::TooLarge(_) => FetchCode::TooLarge,
            FetchError::Excluded => FetchCode::Excluded,
            FetchError::Transient(_) => FetchCode::Internal,
            FetchError::Timeout => FetchCode::Timeout,
            FetchError::DbConflict => FetchCode::Conflict,
            FetchError::Internal(_) => FetchCode::Internal,
        }
    }

    /// Short message suitable for a status row; never the full error chain.
    pub fn bounded_message(&self) -> String {
        let mut msg = self.to_string();
        if msg.len() > 500 {
            msg.truncate(500);
        }
        msg
    }
}

impl From<sqlx::Error> for FetchError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("40001") => {
                FetchError::DbConflict
            }
            sqlx::Error::RowNotFound => FetchError::Internal(e.to_string()),
            _ => FetchError::Transient(format!("database: {e}")),
        }
    }
}
