use std::collections::BTreeMap;

use compact_str::ToCompactString;
use indexmap::IndexSet;
use itertools::Itertools;
use rustc_hash::FxHashMap;

use crate::codec::{self, DocDecl, DocPackage};
use crate::extract::{FileKind, ModuleContents, ModuleFile};
use crate::gosrc::{self, SourceFile};
use crate::license::Redistributability;
use crate::record::{ApiSymbol, BuildContext, Package, SymbolKind, BUILD_CONTEXTS};

/// Synopsis length cap, in characters.
pub const MAX_SYNOPSIS: usize = 500;
/// Import set cap per package.
pub const MAX_IMPORTS: usize = 1000;

/// First sentence of a doc comment: up to a period followed by whitespace
/// or end of text, whitespace collapsed, truncated to [`MAX_SYNOPSIS`].
pub fn synopsis(doc: &str) -> String {
    let collapsed = doc.split_whitespace().join(" ");

    let mut end = collapsed.len();
    let bytes = collapsed.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'.' && bytes.get(i + 1).is_none_or(|n| n.is_ascii_whitespace()) {
            end = i + 1;
            break;
        }
    }
    let mut s = collapsed[..end].to_string();

    if s.chars().count() > MAX_SYNOPSIS {
        s = s.chars().take(MAX_SYNOPSIS).collect();
    }
    s
}

fn exported(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

/// Per-context view of one package directory.
struct CtxPackage {
    name: String,
    doc: String,
    imports: Vec<String>,
    decls: Vec<gosrc::Decl>,
}

fn build_ctx_package(files: &[(&str, &SourceFile)]) -> Option<CtxPackage> {
    let package_name = files.first().map(|(_, f)| f.package_name.clone())?;

    let mut doc = String::new();
    let mut imports: IndexSet<String> = IndexSet::new();
    let mut decls = Vec::new();

    for (_, file) in files {
        if file.package_name != package_name {
            // Mixed package clauses in one directory; keep the first.
            continue;
        }
        if doc.is_empty() {
            if let Some(d) = &file.package_doc {
                doc = d.clone();
            }
        }
        for imp in &file.imports {
            imports.insert(imp.clone());
        }
        decls.extend(file.decls.iter().cloned());
    }

    Some(CtxPackage {
        name: package_name,
        doc,
        imports: imports.into_iter().sorted().collect(),
        decls,
    })
}

/// Symbol name as displayed: methods are `Receiver.Name`.
fn symbol_name(decl: &gosrc::Decl) -> String {
    match &decl.receiver {
        Some(recv) => format!("{recv}.{}", decl.name),
        None => decl.name.clone(),
    }
}

fn exported_decl(decl: &gosrc::Decl) -> bool {
    match &decl.receiver {
        Some(recv) => exported(recv) && exported(&decl.name),
        None => exported(&decl.name),
    }
}

/// Extract one [`Package`] per directory that holds Go source, merging the
/// per-build-context views deterministically: exported symbols are unioned
/// and annotated with the contexts they appear in.
pub fn extract_packages(
    module_path: &str,
    contents: &ModuleContents,
    redist: &Redistributability,
) -> Vec<Package> {
    // Parse each file once; files that fail to scan degrade individually.
    let mut parsed: FxHashMap<&str, SourceFile> = FxHashMap::default();
    let mut by_dir: BTreeMap<&str, Vec<&ModuleFile>> = BTreeMap::new();

    for file in contents.of_kind(FileKind::GoSource) {
        let base = file.path.rsplit('/').next().unwrap_or(&file.path);
        if base.starts_with('_') || base.starts_with('.') || base.ends_with("_test.go") {
            continue;
        }
        let dir = file
            .path
            .rsplit_once('/')
            .map(|(d, _)| d)
            .unwrap_or("");
        by_dir.entry(dir).or_default().push(file);

        match gosrc::scan_file(&file.contents) {
            Ok(sf) => {
                parsed.insert(file.path.as_str(), sf);
            }
            Err(e) => {
                tracing::debug!(path = %file.path, error = %e, "skipping unparseable file");
            }
        }
    }

    let mut packages = Vec::new();
    for (dir, mut files) in by_dir {
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let import_path = if dir.is_empty() {
            module_path.to_string()
        } else {
            format!("{module_path}/{dir}")
        };

        // One view per build context that selects at least one file.
        let mut views: Vec<(BuildContext, CtxPackage)> = Vec::new();
        for &ctx in BUILD_CONTEXTS {
            let selected: Vec<(&str, &SourceFile)> = files
                .iter()
                .filter(|f| {
                    let base = f.path.rsplit('/').next().unwrap_or(&f.path);
                    gosrc::filename_matches(base, ctx.goos(), ctx.goarch())
                })
                .filter_map(|f| parsed.get(f.path.as_str()).map(|sf| (f.path.as_str(), sf)))
                .filter(|(_, sf)| gosrc::constraints_match(sf, ctx.goos(), ctx.goarch()))
                .collect();
            if selected.is_empty() {
                continue;
            }
            if let Some(pkg) = build_ctx_package(&selected) {
                views.push((ctx, pkg));
            }
        }

        if views.is_empty() {
            // Source exists but nothing parsed under any context: an empty
            // package marks the directory rather than dropping it.
            packages.push(Package {
                module_path: module_path.to_compact_string(),
                import_path: import_path.into(),
                name: "".into(),
                synopsis: String::new(),
                imports: IndexSet::new(),
                exported_api: Vec::new(),
                doc_source: Vec::new(),
                goos: None,
                goarch: None,
            });
            continue;
        }

        packages.push(merge_views(module_path, &import_path, dir, views, redist));
    }

    packages
}

fn merge_views(
    module_path: &str,
    import_path: &str,
    dir: &str,
    views: Vec<(BuildContext, CtxPackage)>,
    redist: &Redistributability,
) -> Package {
    // A symbol is annotated with contexts only when some context lacks it.
    let total = views.len();
    let mut symbol_ctxs: IndexSet<(SymbolKind, String, String)> = IndexSet::new();
    let mut presence: FxHashMap<(SymbolKind, String, String), Vec<BuildContext>> =
        FxHashMap::default();
    let mut decl_info: FxHashMap<(SymbolKind, String, String), gosrc::Decl> = FxHashMap::default();

    for (ctx, view) in &views {
        for decl in view.decls.iter().filter(|d| exported_decl(d)) {
            let key = (decl.kind, symbol_name(decl), decl.signature.clone());
            symbol_ctxs.insert(key.clone());
            presence.entry(key.clone()).or_default().push(*ctx);
            decl_info.entry(key).or_insert_with(|| decl.clone());
        }
    }

    let mut exported_api: Vec<ApiSymbol> = symbol_ctxs
        .iter()
        .map(|key| {
            let ctxs = &presence[key];
            ApiSymbol {
                name: key.1.to_compact_string(),
                kind: key.0,
                signature: key.2.clone(),
                contexts: if ctxs.len() == total {
                    Vec::new()
                } else {
                    ctxs.clone()
                },
            }
        })
        .collect();
    exported_api.sort_by(|a, b| a.name.cmp(&b.name).then(a.kind.as_str().cmp(b.kind.as_str())));

    // Docs come from the first context in preference order.
    let (first_ctx, first) = views.first().expect("views is non-empty");
    let uniform = views
        .iter()
        .all(|(_, v)| v.name == first.name && v.imports == first.imports)
        && presence.values().all(|ctxs| ctxs.len() == total);

    let mut imports: IndexSet<_> = views
        .iter()
        .flat_map(|(_, v)| v.imports.iter())
        .sorted()
        .dedup()
        .filter(|imp| imp.as_str() != import_path)
        .map(|s| s.to_compact_string())
        .collect();
    imports.truncate(MAX_IMPORTS);

    let doc_source = if redist.dir_redistributable(dir) {
        let payload = DocPackage {
            name: first.name.clone(),
            doc: first.doc.clone(),
            imports: imports.iter().map(|s| s.to_string()).collect(),
            decls: exported_api
                .iter()
                .map(|sym| DocDecl {
                    kind: sym.kind,
                    name: sym.name.to_string(),
                    signature: sym.signature.clone(),
                    doc: decl_info
                        .get(&(sym.kind, sym.name.to_string(), sym.signature.clone()))
                        .and_then(|d| d.doc.clone())
                        .unwrap_or_default(),
                    contexts: sym.contexts.clone(),
                })
                .collect(),
        };
        codec::encode_package(&payload).unwrap_or_default()
    } else {
        Vec::new()
    };

    Package {
        module_path: module_path.to_compact_string(),
        import_path: import_path.to_compact_string(),
        name: first.name.to_compact_string(),
        synopsis: synopsis(&first.doc),
        imports,
        exported_api,
        doc_source,
        goos: (!uniform).then(|| first_ctx.goos().to_compact_string()),
        goarch: (!uniform).then(|| first_ctx.goarch().to_compact_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::FileKind;
    use crate::record::LicenseFinding;

    fn redistributable() -> Redistributability {
        Redistributability::from_findings(&[LicenseFinding {
            file_path: "LICENSE".into(),
            detected_type: "MIT".into(),
            coverage: 100,
            redistributable: true,
        }])
    }

    fn contents(files: &[(&str, &str)]) -> ModuleContents {
        ModuleContents {
            files: files
                .iter()
                .map(|(path, contents)| ModuleFile {
                    path: path.to_string(),
                    kind: FileKind::GoSource,
                    contents: contents.to_string(),
                })
                .collect(),
            other_paths: Vec::new(),
        }
    }

    #[test]
    fn synopsis_rules() {
        assert_eq!(synopsis("Pkg A. More text."), "Pkg A.");
        assert_eq!(synopsis("Package   a\ndoes\tthings. Rest."), "Package a does things.");
        assert_eq!(synopsis("No trailing period"), "No trailing period");
        assert_eq!(synopsis("See example.com for details. Next."), "See example.com for details.");
        let long = format!("{}.", "x".repeat(600));
        assert_eq!(synopsis(&long).chars().count(), MAX_SYNOPSIS);
    }

    #[test]
    fn extracts_basic_package() {
        let c = contents(&[(
            "a.go",
            "// Package a is tiny.\npackage a\n\nimport \"fmt\"\n\n// F prints.\nfunc F() { fmt.Println() }\n",
        )]);
        let pkgs = extract_packages("example.com/a", &c, &redistributable());
        assert_eq!(pkgs.len(), 1);
        let p = &pkgs[0];
        assert_eq!(p.import_path, "example.com/a");
        assert_eq!(p.name, "a");
        assert_eq!(p.synopsis, "Package a is tiny.");
        assert_eq!(p.imports.iter().map(|s| s.as_str()).collect::<Vec<_>>(), ["fmt"]);
        assert_eq!(p.exported_api.len(), 1);
        assert_eq!(p.exported_api[0].name, "F");
        assert_eq!(p.exported_api[0].kind, SymbolKind::Func);
        assert!(p.exported_api[0].contexts.is_empty());
        assert!(p.goos.is_none());
        assert!(!p.doc_source.is_empty());

        let decoded = codec::decode_package(&p.doc_source).unwrap();
        assert_eq!(decoded.name, "a");
        assert_eq!(decoded.decls[0].doc, "F prints.");
    }

    #[test]
    fn subdirectories_get_their_own_import_path() {
        let c = contents(&[
            ("a.go", "package a\n"),
            ("inner/b.go", "package b\n\nfunc B() {}\n"),
        ]);
        let pkgs = extract_packages("example.com/m", &c, &redistributable());
        let paths: Vec<_> = pkgs.iter().map(|p| p.import_path.as_str()).collect();
        assert_eq!(paths, vec!["example.com/m", "example.com/m/inner"]);
    }

    #[test]
    fn test_files_and_underscore_files_are_skipped() {
        let c = contents(&[
            ("a.go", "package a\n\nfunc A() {}\n"),
            ("a_test.go", "package a\n\nfunc TestA() {}\n"),
            ("_gen.go", "package a\n\nfunc Hidden() {}\n"),
        ]);
        let pkgs = extract_packages("example.com/a", &c, &redistributable());
        assert_eq!(pkgs.len(), 1);
        assert_eq!(pkgs[0].exported_api.len(), 1);
        assert_eq!(pkgs[0].exported_api[0].name, "A");
    }

    #[test]
    fn os_specific_symbols_are_annotated() {
        let c = contents(&[
            ("a.go", "package a\n\nfunc Everywhere() {}\n"),
            ("a_windows.go", "package a\n\nfunc OnWindows() {}\n"),
        ]);
        let pkgs = extract_packages("example.com/a", &c, &redistributable());
        let p = &pkgs[0];
        let every = p.exported_api.iter().find(|s| s.name == "Everywhere").unwrap();
        let win = p.exported_api.iter().find(|s| s.name == "OnWindows").unwrap();
        assert!(every.contexts.is_empty());
        assert_eq!(win.contexts, vec![BuildContext::WindowsAmd64]);
        assert!(p.goos.is_some());
    }

    #[test]
    fn unparseable_file_degrades_alone() {
        let c = contents(&[
            ("good.go", "package a\n\nfunc Good() {}\n"),
            ("bad.go", "package a\nvar X = \"unterminated\n"),
        ]);
        let pkgs = extract_packages("example.com/a", &c, &redistributable());
        assert_eq!(pkgs.len(), 1);
        let names: Vec<_> = pkgs[0].exported_api.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Good"]);
    }

    #[test]
    fn all_unparseable_yields_empty_package() {
        let c = contents(&[("bad.go", "package a\nvar X = \"unterminated\n")]);
        let pkgs = extract_packages("example.com/a", &c, &redistributable());
        assert_eq!(pkgs.len(), 1);
        assert!(pkgs[0].name.is_empty());
        assert!(pkgs[0].exported_api.is_empty());
    }

    #[test]
    fn non_redistributable_dir_elides_doc_source() {
        let findings = [LicenseFinding {
            file_path: "LICENSE".into(),
            detected_type: "unknown".into(),
            coverage: 10,
            redistributable: false,
        }];
        let redist = Redistributability::from_findings(&findings);
        let c = contents(&[("a.go", "package a\n\nfunc F() {}\n")]);
        let pkgs = extract_packages("example.com/a", &c, &redist);
        assert!(pkgs[0].doc_source.is_empty());
        // Metadata survives.
        assert_eq!(pkgs[0].exported_api.len(), 1);
    }

    #[test]
    fn self_import_elided() {
        let c = contents(&[(
            "a.go",
            "package a\n\nimport \"example.com/a\"\n\nfunc F() {}\n",
        )]);
        let pkgs = extract_packages("example.com/a", &c, &redistributable());
        assert!(pkgs[0].imports.is_empty());
    }

    #[test]
    fn methods_require_exported_receiver() {
        let c = contents(&[(
            "a.go",
            "package a\n\ntype T struct{}\n\ntype hidden struct{}\n\nfunc (T) M() {}\n\nfunc (hidden) N() {}\n",
        )]);
        let pkgs = extract_packages("example.com/a", &c, &redistributable());
        let names: Vec<_> = pkgs[0]
            .exported_api
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["T", "T.M"]);
    }
}
