use std::cmp::Ordering;

use compact_str::{CompactString, ToCompactString};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VersionError {
    #[error("version must start with 'v': {0}")]
    MissingPrefix(String),

    #[error("not a valid semantic version: {0}")]
    Malformed(String),

    #[error("unsupported build metadata (only +incompatible is allowed): {0}")]
    BadBuildMetadata(String),
}

/// A canonical Go-style module version: `v` prefix, semver core, optional
/// prerelease, optional `+incompatible`.
///
/// All ordering of versions anywhere in the pipeline goes through
/// [`Version::cmp_canonical`]; LatestView selection goes through
/// [`pick_latest`]. There is deliberately no other comparison path.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Version {
    parsed: semver::Version,
    incompatible: bool,
    raw: CompactString,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let rest = s
            .strip_prefix('v')
            .ok_or_else(|| VersionError::MissingPrefix(s.to_string()))?;

        let parsed: semver::Version = rest
            .parse()
            .map_err(|_| VersionError::Malformed(s.to_string()))?;

        let incompatible = match parsed.build.as_str() {
            "" => false,
            "incompatible" => true,
            _ => return Err(VersionError::BadBuildMetadata(s.to_string())),
        };

        Ok(Self {
            parsed,
            incompatible,
            raw: s.to_compact_string(),
        })
    }

    /// The canonical string form, `v`-prefixed.
    pub fn canonical(&self) -> CompactString {
        self.raw.clone()
    }

    pub fn is_prerelease(&self) -> bool {
        !self.parsed.pre.is_empty()
    }

    /// Pseudo-versions are generated for untagged commits and carry a
    /// trailing `yyyymmddhhmmss-abcdefabcdef` pair in the prerelease.
    pub fn is_pseudo(&self) -> bool {
        // The stamp and hash form the final dot-separated prerelease
        // identifier, joined by a hyphen.
        let pre = self.parsed.pre.as_str();
        let Some(last) = pre.rsplit('.').next() else {
            return false;
        };
        let Some((stamp, hash)) = last.split_once('-') else {
            return false;
        };
        stamp.len() == 14
            && stamp.bytes().all(|b| b.is_ascii_digit())
            && hash.len() == 12
            && hash.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// The single comparison function for module versions.
    ///
    /// Canonical semver precedence, with build metadata excluded from the
    /// order except that `+incompatible` sorts below the identical version
    /// without the suffix.
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        match self.parsed.cmp_precedence(&other.parsed) {
            Ordering::Equal => other.incompatible.cmp(&self.incompatible),
            ord => ord,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.raw.fmt(f)
    }
}

/// Canonicalize a raw version string, or report why it cannot be.
pub fn canonical(s: &str) -> Result<CompactString, VersionError> {
    Version::parse(s).map(|v| v.canonical())
}

fn class(v: &Version) -> u8 {
    if v.is_pseudo() {
        0
    } else if v.is_prerelease() {
        1
    } else {
        2
    }
}

/// Pick the version LatestView should point at: the greatest release,
/// falling back to the greatest plain prerelease, then to the greatest
/// pseudo-version, when nothing better exists.
pub fn pick_latest<'a>(versions: impl IntoIterator<Item = &'a str>) -> Option<CompactString> {
    versions
        .into_iter()
        .filter_map(|s| Version::parse(s).ok())
        .max_by(|a, b| match class(a).cmp(&class(b)) {
            Ordering::Equal => a.cmp_canonical(b),
            ord => ord,
        })
        .map(|v| v.canonical())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_and_canonical() {
        assert_eq!(canonical("v1.2.3").unwrap(), "v1.2.3");
        assert_eq!(canonical("v2.0.0+incompatible").unwrap(), "v2.0.0+incompatible");
        assert!(canonical("1.2.3").is_err());
        assert!(canonical("v1.2").is_err());
        assert!(canonical("v1.2.3+banana").is_err());
    }

    #[test]
    fn pseudo_detection() {
        for v in [
            "v0.0.0-20240102030405-0123456789ab",
            "v1.2.3-pre.0.20240102030405-0123456789ab",
            "v1.3.0-0.20240102030405-0123456789ab",
        ] {
            assert!(Version::parse(v).unwrap().is_pseudo(), "{v}");
        }
        for v in ["v1.2.3", "v1.2.3-beta.1", "v1.2.3-rc1"] {
            assert!(!Version::parse(v).unwrap().is_pseudo(), "{v}");
        }
    }

    #[test]
    fn ordering() {
        let cmp = |a: &str, b: &str| {
            Version::parse(a)
                .unwrap()
                .cmp_canonical(&Version::parse(b).unwrap())
        };
        assert_eq!(cmp("v1.0.0", "v1.0.1"), Ordering::Less);
        assert_eq!(cmp("v1.0.0-alpha", "v1.0.0"), Ordering::Less);
        assert_eq!(cmp("v2.0.0+incompatible", "v2.0.0"), Ordering::Less);
        assert_eq!(cmp("v2.0.0+incompatible", "v1.9.0"), Ordering::Greater);
    }

    #[test]
    fn latest_prefers_releases() {
        let latest = pick_latest(["v1.0.0", "v1.1.0-beta.1", "v0.9.0"]).unwrap();
        assert_eq!(latest, "v1.0.0");

        let latest = pick_latest([
            "v1.1.0-beta.1",
            "v0.0.0-20240102030405-0123456789ab",
        ])
        .unwrap();
        assert_eq!(latest, "v1.1.0-beta.1");

        let latest = pick_latest(["v0.0.0-20240102030405-0123456789ab"]).unwrap();
        assert_eq!(latest, "v0.0.0-20240102030405-0123456789ab");

        assert_eq!(pick_latest([]), None);
    }

    fn arb_version() -> impl Strategy<Value = Version> {
        (0u64..4, 0u64..10, 0u64..10, 0usize..3, prop::bool::ANY).prop_map(
            |(maj, min, pat, pre, incompat)| {
                let mut s = format!("v{maj}.{min}.{pat}");
                match pre {
                    1 => s.push_str("-alpha.1"),
                    2 => s.push_str("-rc.2"),
                    _ => {}
                }
                if incompat && pre == 0 {
                    s.push_str("+incompatible");
                }
                Version::parse(&s).unwrap()
            },
        )
    }

    proptest! {
        #[test]
        fn order_is_total_and_antisymmetric(a in arb_version(), b in arb_version()) {
            let ab = a.cmp_canonical(&b);
            let ba = b.cmp_canonical(&a);
            prop_assert_eq!(ab, ba.reverse());
            if ab == Ordering::Equal {
                prop_assert_eq!(a.parsed.cmp_precedence(&b.parsed), Ordering::Equal);
            }
        }

        #[test]
        fn order_is_transitive(a in arb_version(), b in arb_version(), c in arb_version()) {
            let mut v = vec![a, b, c];
            v.sort_by(|x, y| x.cmp_canonical(y));
            prop_assert!(v[0].cmp_canonical(&v[2]) != Ordering::Greater);
        }
    }
}
