use std::io::{Cursor, Read};

use thiserror::Error;
use zip::ZipArchive;

use crate::outcome::FetchError;
use crate::proxy::escape_path;

/// Per-file size cap.
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
/// Uncompressed size cap for the whole module.
pub const MAX_MODULE_BYTES: u64 = 500 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("{0}")]
    TooLarge(String),

    #[error("invalid module archive: {0}")]
    Invalid(String),
}

impl From<ExtractError> for FetchError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::TooLarge(m) => FetchError::TooLarge(m),
            ExtractError::Invalid(m) => FetchError::Invalid(m),
        }
    }
}

impl From<zip::result::ZipError> for ExtractError {
    fn from(e: zip::result::ZipError) -> Self {
        ExtractError::Invalid(e.to_string())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileKind {
    GoSource,
    Readme,
    License,
    Other,
}

/// One classified file from the module archive, path relative to the
/// module root.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ModuleFile {
    pub path: String,
    pub kind: FileKind,
    pub contents: String,
}

/// Result of unpacking one module archive. Contents are retained only for
/// the kinds the pipeline reads; everything else contributes its path.
#[derive(Clone, Default, Debug)]
pub struct ModuleContents {
    pub files: Vec<ModuleFile>,
    pub other_paths: Vec<String>,
}

impl ModuleContents {
    pub fn of_kind(&self, kind: FileKind) -> impl Iterator<Item = &ModuleFile> {
        self.files.iter().filter(move |f| f.kind == kind)
    }
}

/// Classify a path relative to the module root.
pub fn classify(path: &str) -> FileKind {
    let base = path.rsplit('/').next().unwrap_or(path);
    let lower = base.to_ascii_lowercase();

    if lower.ends_with(".go") {
        // Vendored trees are not part of the module's own API surface.
        if path.starts_with("vendor/") || path.contains("/vendor/") {
            return FileKind::Other;
        }
        return FileKind::GoSource;
    }

    let stem = lower
        .strip_suffix(".md")
        .or_else(|| lower.strip_suffix(".markdown"))
        .or_else(|| lower.strip_suffix(".txt"))
        .unwrap_or(&lower);
    match stem {
        "readme" => FileKind::Readme,
        "license" | "licence" | "copying" => FileKind::License,
        _ => FileKind::Other,
    }
}

fn check_entry_path(path: &str) -> Result<(), ExtractError> {
    let bad = path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(ExtractError::Invalid(format!("unsafe entry path: {path}")));
    }
    Ok(())
}

/// Unpack a module archive into classified, size-capped contents.
///
/// The archive must place every entry under `<module_escaped>@<version>/`.
/// Symlinks, absolute paths and traversal segments are rejected outright;
/// crossing either size cap fails the whole module.
pub fn extract_module(
    zip_bytes: &[u8],
    module: &str,
    version: &str,
) -> Result<ModuleContents, ExtractError> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;

    let root = format!("{}@{}/", escape_path(module), version);
    let mut out = ModuleContents::default();
    let mut total: u64 = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let full = entry.name().to_string();
        check_entry_path(&full)?;
        let symlink = entry
            .unix_mode()
            .is_some_and(|mode| mode & 0o170000 == 0o120000);
        if symlink {
            return Err(ExtractError::Invalid(format!("symlink in archive: {full}")));
        }

        let Some(rel) = full.strip_prefix(&root) else {
            return Err(ExtractError::Invalid(format!(
                "entry outside module root {root}: {full}"
            )));
        };

        total = total.saturating_add(entry.size());
        if total > MAX_MODULE_BYTES {
            return Err(ExtractError::TooLarge(format!(
                "module exceeds {MAX_MODULE_BYTES} bytes uncompressed"
            )));
        }
        if entry.size() > MAX_FILE_BYTES {
            return Err(ExtractError::TooLarge(format!(
                "{rel} is {} bytes (cap {MAX_FILE_BYTES})",
                entry.size()
            )));
        }

        let kind = classify(rel);
        if kind == FileKind::Other {
            out.other_paths.push(rel.to_string());
            continue;
        }

        // Reading with a one-past cap catches archives whose directory
        // lies about entry sizes.
        let mut contents = String::new();
        match entry
            .by_ref()
            .take(MAX_FILE_BYTES + 1)
            .read_to_string(&mut contents)
        {
            Ok(n) if n as u64 > MAX_FILE_BYTES => {
                return Err(ExtractError::TooLarge(format!(
                    "{rel} exceeds {MAX_FILE_BYTES} bytes"
                )));
            }
            Ok(_) => out.files.push(ModuleFile {
                path: rel.to_string(),
                kind,
                contents,
            }),
            // Not valid UTF-8: degrade to an unclassified path rather than
            // failing the module.
            Err(_) => out.other_paths.push(rel.to_string()),
        }
    }

    Ok(out)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Build an in-memory module archive for tests elsewhere in the crate.
    pub fn build_zip(root: &str, files: &[(&str, &str)]) -> Vec<u8> {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (path, contents) in files {
            w.start_file(format!("{root}/{path}"), SimpleFileOptions::default())
                .unwrap();
            w.write_all(contents.as_bytes()).unwrap();
        }
        w.finish().unwrap().into_inner()
    }

    #[test]
    fn classify_kinds() {
        assert_eq!(classify("a.go"), FileKind::GoSource);
        assert_eq!(classify("sub/pkg/a.go"), FileKind::GoSource);
        assert_eq!(classify("vendor/x/a.go"), FileKind::Other);
        assert_eq!(classify("sub/vendor/x/a.go"), FileKind::Other);
        assert_eq!(classify("README.md"), FileKind::Readme);
        assert_eq!(classify("sub/readme"), FileKind::Readme);
        assert_eq!(classify("LICENSE"), FileKind::License);
        assert_eq!(classify("LICENCE.txt"), FileKind::License);
        assert_eq!(classify("COPYING"), FileKind::License);
        assert_eq!(classify("Makefile"), FileKind::Other);
        assert_eq!(classify("license_header.go"), FileKind::GoSource);
    }

    #[test]
    fn extracts_classified_files() {
        let zip = build_zip(
            "example.com/a@v1.0.0",
            &[
                ("a.go", "package a\n"),
                ("LICENSE", "MIT License\n"),
                ("README.md", "# a\n"),
                ("testdata/blob.bin", "xx"),
            ],
        );
        let contents = extract_module(&zip, "example.com/a", "v1.0.0").unwrap();
        assert_eq!(contents.files.len(), 3);
        assert_eq!(contents.other_paths, vec!["testdata/blob.bin"]);
        assert_eq!(contents.of_kind(FileKind::GoSource).count(), 1);
    }

    #[test]
    fn escaped_root_for_uppercase_modules() {
        let zip = build_zip(
            "github.com/!burnt!sushi/toml@v1.0.0",
            &[("doc.go", "package toml\n")],
        );
        let contents = extract_module(&zip, "github.com/BurntSushi/toml", "v1.0.0").unwrap();
        assert_eq!(contents.files.len(), 1);
    }

    #[test]
    fn rejects_entry_outside_root() {
        let zip = build_zip("example.com/other@v1.0.0", &[("a.go", "package a\n")]);
        let err = extract_module(&zip, "example.com/a", "v1.0.0").unwrap_err();
        assert!(matches!(err, ExtractError::Invalid(_)));
    }

    #[test]
    fn rejects_traversal() {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        w.start_file(
            "example.com/a@v1.0.0/../escape.go",
            SimpleFileOptions::default(),
        )
        .unwrap();
        w.write_all(b"package a\n").unwrap();
        let zip = w.finish().unwrap().into_inner();

        let err = extract_module(&zip, "example.com/a", "v1.0.0").unwrap_err();
        assert!(matches!(err, ExtractError::Invalid(_)));
    }

    #[test]
    fn skips_binary_file_contents() {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        w.start_file("example.com/a@v1.0.0/bad.go", SimpleFileOptions::default())
            .unwrap();
        w.write_all(&[0xff, 0xfe, 0x00]).unwrap();
        let zip = w.finish().unwrap().into_inner();

        let contents = extract_module(&zip, "example.com/a", "v1.0.0").unwrap();
        assert!(contents.files.is_empty());
        assert_eq!(contents.other_paths, vec!["bad.go"]);
    }
}
