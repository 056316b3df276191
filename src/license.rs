use compact_str::{CompactString, ToCompactString};
use rustc_hash::FxHashSet;

use crate::record::LicenseFinding;

/// Classification below this coverage is reported as `unknown`.
pub const MIN_COVERAGE: u8 = 75;

struct Template {
    id: &'static str,
    redistributable: bool,
    /// Distinctive phrases, matched over normalized text. Coverage is the
    /// share of phrases present.
    phrases: &'static [&'static str],
}

/// Known license templates. Order matters only to break coverage ties.
static CATALOG: &[Template] = &[
    Template {
        id: "MIT",
        redistributable: true,
        phrases: &[
            "permission is hereby granted free of charge",
            "to deal in the software without restriction",
            "the software is provided as is without warranty of any kind",
            "the above copyright notice and this permission notice shall be included",
        ],
    },
    Template {
        id: "BSD-3-Clause",
        redistributable: true,
        phrases: &[
            "redistribution and use in source and binary forms",
            "redistributions of source code must retain the above copyright notice",
            "redistributions in binary form must reproduce the above copyright notice",
            "neither the name of the copyright holder nor the names of its contributors",
        ],
    },
    Template {
        id: "BSD-2-Clause",
        redistributable: true,
        phrases: &[
            "redistribution and use in source and binary forms",
            "redistributions of source code must retain the above copyright notice",
            "redistributions in binary form must reproduce the above copyright notice",
            "this software is provided by the copyright holders and contributors as is",
        ],
    },
    Template {
        id: "Apache-2.0",
        redistributable: true,
        phrases: &[
            "apache license version 2 0",
            "licensed under the apache license version 2 0",
            "unless required by applicable law or agreed to in writing",
            "distributed under the license is distributed on an as is basis",
        ],
    },
    Template {
        id: "ISC",
        redistributable: true,
        phrases: &[
            "permission to use copy modify and or distribute this software",
            "provided that the above copyright notice and this permission notice appear",
            "the software is provided as is and the author disclaims all warranties",
        ],
    },
    Template {
        id: "MPL-2.0",
        redistributable: true,
        phrases: &[
            "mozilla public license version 2 0",
            "this source code form is subject to the terms of the mozilla public license",
            "if a copy of the mpl was not distributed with this file",
        ],
    },
    Template {
        id: "GPL-2.0",
        redistributable: true,
        phrases: &[
            "gnu general public license version 2",
            "this program is free software you can redistribute it and or modify",
            "either version 2 of the license",
            "without even the implied warranty of merchantability",
        ],
    },
    Template {
        id: "GPL-3.0",
        redistributable: true,
        phrases: &[
            "gnu general public license version 3",
            "this program is free software you can redistribute it and or modify",
            "either version 3 of the license",
            "without even the implied warranty of merchantability",
        ],
    },
    Template {
        id: "AGPL-3.0",
        redistributable: true,
        phrases: &[
            "gnu affero general public license",
            "either version 3 of the license",
            "without even the implied warranty of merchantability",
        ],
    },
    Template {
        id: "Unlicense",
        redistributable: true,
        phrases: &[
            "this is free and unencumbered software released into the public domain",
            "anyone is free to copy modify publish use compile sell or distribute",
        ],
    },
    // Source-available terms that forbid republication.
    Template {
        id: "Commons-Clause",
        redistributable: false,
        phrases: &[
            "commons clause license condition",
            "the software is provided to you by the licensor under the license as defined below subject to the following condition",
            "does not include and the license does not grant to you the right to sell",
        ],
    },
    Template {
        id: "BUSL-1.1",
        redistributable: false,
        phrases: &[
            "business source license 1 1",
            "the licensor hereby grants you the right to copy modify create derivative works",
            "change date",
            "change license",
        ],
    },
];

fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            for l in c.to_lowercase() {
                out.push(l);
            }
            space = false;
        } else if !space {
            out.push(' ');
            space = true;
        }
    }
    out
}

/// Match file contents against the catalog, yielding the best
/// `(type, coverage)` pair; below [`MIN_COVERAGE`] the type is `unknown`.
pub fn detect(contents: &str) -> (CompactString, u8) {
    let normalized = normalize(contents);

    let mut best: (&str, u8) = ("unknown", 0);
    for template in CATALOG {
        let matched = template
            .phrases
            .iter()
            .filter(|p| normalized.contains(**p))
            .count();
        let coverage = (matched * 100 / template.phrases.len()) as u8;
        if coverage > best.1 {
            best = (template.id, coverage);
        }
    }

    if best.1 >= MIN_COVERAGE {
        (best.0.to_compact_string(), best.1)
    } else {
        ("unknown".to_compact_string(), best.1)
    }
}

fn allowed(detected_type: &str) -> bool {
    CATALOG
        .iter()
        .any(|t| t.id == detected_type && t.redistributable)
}

/// Run detection over every license file of a module.
pub fn detect_all(files: impl Iterator<Item = (String, String)>) -> Vec<LicenseFinding> {
    let mut findings: Vec<LicenseFinding> = files
        .map(|(path, contents)| {
            let (detected_type, coverage) = detect(&contents);
            let redistributable = coverage >= MIN_COVERAGE && allowed(&detected_type);
            LicenseFinding {
                file_path: path.into(),
                detected_type,
                coverage,
                redistributable,
            }
        })
        .collect();
    findings.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    findings
}

fn dir_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Per-directory redistributability, derived from the findings.
///
/// The module root must carry at least one allow-listed finding; every
/// directory that has license files of its own must as well; and any
/// `unknown` or deny-listed finding poisons its directory and all
/// descendants. Directories without license files inherit their parent.
#[derive(Clone, Debug)]
pub struct Redistributability {
    root_ok: bool,
    poisoned: Vec<String>,
}

impl Redistributability {
    pub fn from_findings(findings: &[LicenseFinding]) -> Self {
        let mut dirs: FxHashSet<&str> = FxHashSet::default();
        for f in findings {
            dirs.insert(dir_of(&f.file_path));
        }

        let mut poisoned = Vec::new();
        let mut root_ok = false;
        for dir in dirs {
            let in_dir = findings.iter().filter(|f| dir_of(&f.file_path) == dir);
            let mut any_allowed = false;
            let mut any_poison = false;
            for f in in_dir {
                if f.redistributable {
                    any_allowed = true;
                } else {
                    any_poison = true;
                }
            }
            if dir.is_empty() {
                root_ok = any_allowed && !any_poison;
            } else if !any_allowed || any_poison {
                poisoned.push(dir.to_string());
            }
        }
        poisoned.sort();

        Self { root_ok, poisoned }
    }

    /// Whether packages under `dir` (relative to the module root, "" for
    /// the root itself) may retain source-derived blobs.
    pub fn dir_redistributable(&self, dir: &str) -> bool {
        self.root_ok
            && !self
                .poisoned
                .iter()
                .any(|p| dir == p || (dir.len() > p.len() && dir.starts_with(p) && dir.as_bytes()[p.len()] == b'/'))
    }

    /// Module-level flag: the root verdict.
    pub fn module_redistributable(&self) -> bool {
        self.root_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIT_TEXT: &str = "MIT License\n\nCopyright (c) 2024 Example\n\n\
Permission is hereby granted, free of charge, to any person obtaining a copy \
of this software and associated documentation files (the \"Software\"), to deal \
in the Software without restriction, including without limitation the rights \
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell \
copies of the Software, and to permit persons to whom the Software is \
furnished to do so, subject to the following conditions:\n\n\
The above copyright notice and this permission notice shall be included in all \
copies or substantial portions of the Software.\n\n\
THE SOFTWARE IS PROVIDED \"AS IS\", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR \
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, \
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT.";

    const BSD3_TEXT: &str = "Redistribution and use in source and binary forms, with or \
without modification, are permitted provided that the following conditions are met:\n\
1. Redistributions of source code must retain the above copyright notice, this list \
of conditions and the following disclaimer.\n\
2. Redistributions in binary form must reproduce the above copyright notice, this \
list of conditions and the following disclaimer in the documentation.\n\
3. Neither the name of the copyright holder nor the names of its contributors may \
be used to endorse or promote products derived from this software.";

    #[test]
    fn detects_known_licenses() {
        let (ty, coverage) = detect(MIT_TEXT);
        assert_eq!(ty, "MIT");
        assert!(coverage >= MIN_COVERAGE);

        let (ty, coverage) = detect(BSD3_TEXT);
        assert_eq!(ty, "BSD-3-Clause");
        assert!(coverage >= MIN_COVERAGE);
    }

    #[test]
    fn unknown_below_threshold() {
        let (ty, coverage) = detect("All rights reserved. Proprietary and confidential.");
        assert_eq!(ty, "unknown");
        assert!(coverage < MIN_COVERAGE);
    }

    #[test]
    fn root_license_gates_module() {
        let findings = detect_all(
            [("LICENSE".to_string(), MIT_TEXT.to_string())]
                .into_iter(),
        );
        let redist = Redistributability::from_findings(&findings);
        assert!(redist.module_redistributable());
        assert!(redist.dir_redistributable(""));
        assert!(redist.dir_redistributable("sub/deep"));
    }

    #[test]
    fn unknown_root_poisons_everything() {
        let findings = detect_all(
            [("LICENSE".to_string(), "custom terms".to_string())]
                .into_iter(),
        );
        let redist = Redistributability::from_findings(&findings);
        assert!(!redist.module_redistributable());
        assert!(!redist.dir_redistributable("sub"));
    }

    #[test]
    fn missing_root_license_poisons_everything() {
        let findings = detect_all(
            [("sub/LICENSE".to_string(), MIT_TEXT.to_string())]
                .into_iter(),
        );
        let redist = Redistributability::from_findings(&findings);
        assert!(!redist.module_redistributable());
        assert!(!redist.dir_redistributable("sub"));
    }

    #[test]
    fn subdirectory_poison_is_scoped() {
        let findings = detect_all(
            [
                ("LICENSE".to_string(), MIT_TEXT.to_string()),
                ("closed/LICENSE".to_string(), "custom terms".to_string()),
            ]
            .into_iter(),
        );
        let redist = Redistributability::from_findings(&findings);
        assert!(redist.module_redistributable());
        assert!(redist.dir_redistributable("open"));
        assert!(!redist.dir_redistributable("closed"));
        assert!(!redist.dir_redistributable("closed/inner"));
        assert!(redist.dir_redistributable("closedish"));
    }
}
