use std::fmt::Display;

use chrono::{DateTime, Utc};
use compact_str::{CompactString, ToCompactString};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Identity of one ingestable unit: a module path plus a canonical version.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ModuleVersion {
    pub module_path: CompactString,
    pub version: CompactString,
}

impl ModuleVersion {
    pub fn new(module_path: impl AsRef<str>, version: impl AsRef<str>) -> Self {
        Self {
            module_path: module_path.as_ref().to_compact_string(),
            version: version.as_ref().to_compact_string(),
        }
    }
}

impl Display for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.module_path, self.version)
    }
}

/// One record from the upstream index stream.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct IndexEntry {
    #[serde(rename = "Path")]
    pub module_path: CompactString,
    #[serde(rename = "Version")]
    pub version: CompactString,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Cursor into the upstream index stream. Advances monotonically.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct IndexCursor {
    pub last_seen_timestamp: Option<DateTime<Utc>>,
    pub last_seen_key: Option<CompactString>,
}

impl IndexCursor {
    pub fn advance(&mut self, entry: &IndexEntry) {
        self.last_seen_timestamp = Some(entry.timestamp);
        self.last_seen_key = Some(format!("{}@{}", entry.module_path, entry.version).into());
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Const,
    Var,
    Func,
    Type,
    Method,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolKind::Const => "const",
            SymbolKind::Var => "var",
            SymbolKind::Func => "func",
            SymbolKind::Type => "type",
            SymbolKind::Method => "method",
        }
    }
}

/// One exported top-level symbol of a package.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ApiSymbol {
    pub name: CompactString,
    pub kind: SymbolKind,
    pub signature: String,
    /// Build contexts the symbol was seen under; empty means all contexts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<BuildContext>,
}

/// A GOOS/GOARCH pair the doc extractor parses under.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BuildContext {
    LinuxAmd64,
    WindowsAmd64,
    DarwinAmd64,
    JsWasm,
}

impl BuildContext {
    pub fn goos(self) -> &'static str {
        match self {
            BuildContext::LinuxAmd64 => "linux",
            BuildContext::WindowsAmd64 => "windows",
            BuildContext::DarwinAmd64 => "darwin",
            BuildContext::JsWasm => "js",
        }
    }

    pub fn goarch(self) -> &'static str {
        match self {
            BuildContext::LinuxAmd64 => "amd64",
            BuildContext::WindowsAmd64 => "amd64",
            BuildContext::DarwinAmd64 => "amd64",
            BuildContext::JsWasm => "wasm",
        }
    }
}

impl Display for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.goos(), self.goarch())
    }
}

/// The build contexts documentation is extracted for, in preference order.
pub const BUILD_CONTEXTS: &[BuildContext] = &[
    BuildContext::LinuxAmd64,
    BuildContext::WindowsAmd64,
    BuildContext::DarwinAmd64,
    BuildContext::JsWasm,
];

/// Documentation record for one package directory.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Package {
    pub module_path: CompactString,
    pub import_path: CompactString,
    pub name: CompactString,
    pub synopsis: String,
    pub imports: IndexSet<CompactString>,
    pub exported_api: Vec<ApiSymbol>,
    /// Encoded documentation blob; empty when the package directory is not
    /// redistributable. First four bytes identify the encoding version.
    pub doc_source: Vec<u8>,
    /// GOOS the docs are specific to; `None` means identical for all contexts.
    pub goos: Option<CompactString>,
    pub goarch: Option<CompactString>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct LicenseFinding {
    pub file_path: CompactString,
    /// SPDX-like identifier, or `"unknown"` below the coverage threshold.
    pub detected_type: CompactString,
    /// 0..=100.
    pub coverage: u8,
    pub redistributable: bool,
}

/// Deep-link information for mapping import paths back to a repository.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct SourceInfo {
    pub repo_url: String,
    pub revision: String,
    /// Directory of the module within the repository; empty at the root.
    pub directory: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Readme {
    pub file_path: CompactString,
    pub contents: String,
}

/// Everything a successful fetch produces for one `ModuleVersion`.
///
/// Replaced wholesale on reprocess, never partially mutated. When
/// `redistributable` is false the source-derived blobs (`doc_source`,
/// readme contents) are elided and only metadata is retained.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ModuleRecord {
    pub id: ModuleVersion,
    pub commit_time: DateTime<Utc>,
    pub go_mod: Vec<u8>,
    pub has_go_mod: bool,
    pub redistributable: bool,
    pub packages: Vec<Package>,
    pub licenses: Vec<LicenseFinding>,
    pub readme: Option<Readme>,
    pub source_info: Option<SourceInfo>,
}

/// Administrative entry that blocks ingestion of a path prefix or one
/// exact `module@version`.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ExclusionEntry {
    pub prefix: CompactString,
    pub reason: String,
    pub author: CompactString,
    pub created_at: DateTime<Utc>,
}

impl ExclusionEntry {
    /// Whether `prefix` covers the given identity: exact path, path prefix
    /// on a `/` boundary, or exact `module@version`.
    pub fn covers(&self, module_path: &str, version: Option<&str>) -> bool {
        let prefix = self.prefix.as_str();
        if let Some((p, v)) = prefix.rsplit_once('@') {
            return module_path == p && version == Some(v);
        }
        module_path == prefix
            || (module_path.len() > prefix.len()
                && module_path.starts_with(prefix)
                && module_path.as_bytes()[prefix.len()] == b'/')
    }
}

/// Stored outcome of the most recent fetch attempt for an identity.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct FetchStatus {
    pub id: ModuleVersion,
    pub code: u16,
    pub error_kind: CompactString,
    pub error_message: String,
    pub try_count: i32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_attempted_at: DateTime<Utc>,
    pub app_version_label: CompactString,
}

impl ModuleVersion {
    /// Parse a composite `module@version` key.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (m, v) = s
            .rsplit_once('@')
            .ok_or_else(|| format!("missing @ in module version: {s}"))?;
        if m.is_empty() || v.is_empty() {
            return Err(format!("empty module or version: {s}"));
        }
        Ok(Self::new(m, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_prefix_matching() {
        let entry = ExclusionEntry {
            prefix: "example.com/bad".into(),
            reason: "spam".into(),
            author: "admin".into(),
            created_at: Utc::now(),
        };
        assert!(entry.covers("example.com/bad", None));
        assert!(entry.covers("example.com/bad/x", Some("v1.0.0")));
        assert!(!entry.covers("example.com/badge", None));
        assert!(!entry.covers("example.com", Some("v1.0.0")));
    }

    #[test]
    fn exclusion_exact_version() {
        let entry = ExclusionEntry {
            prefix: "example.com/a@v1.2.3".into(),
            reason: "dmca".into(),
            author: "admin".into(),
            created_at: Utc::now(),
        };
        assert!(entry.covers("example.com/a", Some("v1.2.3")));
        assert!(!entry.covers("example.com/a", Some("v1.2.4")));
        assert!(!entry.covers("example.com/a", None));
        assert!(!entry.covers("example.com/a/sub", Some("v1.2.3")));
    }

    #[test]
    fn module_version_parse() {
        let mv = ModuleVersion::parse("example.com/a@v1.0.0").unwrap();
        assert_eq!(mv.module_path, "example.com/a");
        assert_eq!(mv.version, "v1.0.0");
        assert!(ModuleVersion::parse("example.com/a").is_err());
    }
}
