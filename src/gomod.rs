use thiserror::Error;

use crate::outcome::FetchError;
use crate::version::Version;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GoModError {
    #[error("go.mod is not valid utf-8")]
    NotUtf8,

    #[error("go.mod has no module directive")]
    NoModule,

    #[error("malformed go.mod line: {0}")]
    Malformed(String),
}

impl From<GoModError> for FetchError {
    fn from(e: GoModError) -> Self {
        FetchError::Invalid(e.to_string())
    }
}

/// A retract directive: one version or an inclusive range.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Retract {
    Single(String),
    Range(String, String),
}

/// The subset of go.mod the pipeline consumes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GoMod {
    pub module_path: String,
    pub retracted: Vec<Retract>,
}

impl GoMod {
    /// Whether `version` is withdrawn by a retract directive.
    pub fn is_retracted(&self, version: &str) -> bool {
        let Ok(v) = Version::parse(version) else {
            return false;
        };
        self.retracted.iter().any(|r| match r {
            Retract::Single(s) => s == version,
            Retract::Range(lo, hi) => {
                match (Version::parse(lo), Version::parse(hi)) {
                    (Ok(lo), Ok(hi)) => {
                        lo.cmp_canonical(&v) != std::cmp::Ordering::Greater
                            && v.cmp_canonical(&hi) != std::cmp::Ordering::Greater
                    }
                    _ => false,
                }
            }
        })
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    }
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

fn parse_retract_item(item: &str) -> Result<Retract, GoModError> {
    let item = item.trim();
    if let Some(range) = item.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let (lo, hi) = range
            .split_once(',')
            .ok_or_else(|| GoModError::Malformed(item.to_string()))?;
        return Ok(Retract::Range(
            lo.trim().to_string(),
            hi.trim().to_string(),
        ));
    }
    // The rationale string after the version, if any, is ignored.
    let version = item
        .split_whitespace()
        .next()
        .ok_or_else(|| GoModError::Malformed(item.to_string()))?;
    Ok(Retract::Single(unquote(version).to_string()))
}

/// Parse go.mod far enough for ingestion: the module directive and any
/// retract directives. Everything else (require, replace, toolchain) is
/// irrelevant here and skipped.
pub fn parse(bytes: &[u8]) -> Result<GoMod, GoModError> {
    let text = std::str::from_utf8(bytes).map_err(|_| GoModError::NotUtf8)?;

    let mut module_path = None;
    let mut retracted = Vec::new();
    let mut block: Option<&str> = None;

    for raw in text.lines() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(directive) = block {
            if line == ")" {
                block = None;
            } else if directive == "retract" {
                retracted.push(parse_retract_item(line)?);
            }
            continue;
        }

        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (line, ""),
        };

        match keyword {
            "module" => {
                if rest.is_empty() {
                    return Err(GoModError::Malformed(raw.to_string()));
                }
                module_path = Some(unquote(rest).to_string());
            }
            "retract" => {
                if rest == "(" {
                    block = Some("retract");
                } else {
                    retracted.push(parse_retract_item(rest)?);
                }
            }
            "require" | "exclude" | "replace" => {
                if rest == "(" {
                    block = Some(keyword);
                }
            }
            _ => {}
        }
    }

    Ok(GoMod {
        module_path: module_path.ok_or(GoModError::NoModule)?,
        retracted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_directive() {
        let m = parse(b"module example.com/a\n\ngo 1.21\n").unwrap();
        assert_eq!(m.module_path, "example.com/a");
        assert!(m.retracted.is_empty());
    }

    #[test]
    fn parses_quoted_module() {
        let m = parse(b"module \"example.com/a\"\n").unwrap();
        assert_eq!(m.module_path, "example.com/a");
    }

    #[test]
    fn missing_module_is_an_error() {
        assert_eq!(parse(b"go 1.21\n"), Err(GoModError::NoModule));
    }

    #[test]
    fn parses_retractions() {
        let m = parse(
            b"module example.com/a\n\nretract v1.0.1 // broken\n\nretract (\n\tv1.1.0\n\t[v1.2.0, v1.3.0] // bad range\n)\n",
        )
        .unwrap();
        assert_eq!(
            m.retracted,
            vec![
                Retract::Single("v1.0.1".into()),
                Retract::Single("v1.1.0".into()),
                Retract::Range("v1.2.0".into(), "v1.3.0".into()),
            ]
        );
        assert!(m.is_retracted("v1.0.1"));
        assert!(m.is_retracted("v1.1.0"));
        assert!(m.is_retracted("v1.2.5"));
        assert!(m.is_retracted("v1.3.0"));
        assert!(!m.is_retracted("v1.3.1"));
        assert!(!m.is_retracted("v1.0.0"));
    }

    #[test]
    fn require_blocks_are_skipped() {
        let m = parse(
            b"module example.com/a\n\nrequire (\n\texample.com/dep v1.0.0\n\tretract v9.9.9\n)\n",
        )
        .unwrap();
        assert!(m.retracted.is_empty());
    }

    #[test]
    fn invalid_utf8() {
        assert_eq!(parse(&[0xff, 0xfe]), Err(GoModError::NotUtf8));
    }
}
