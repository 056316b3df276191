//! Binary encoding of extracted package documentation.
//!
//! The blob is self-describing: the first four bytes are an encoding
//! marker, and decoders reject unknown markers rather than guess. All
//! strings live in one table; declarations refer to them by integer
//! index, so shared text (signatures, docs, names) is stored once and
//! back-references are indices rather than pointers.

use std::io::{Read, Write};

use integer_encoding::{VarIntReader, VarIntWriter};
use thiserror::Error;

use crate::record::{BuildContext, SymbolKind};

/// Encoding version marker.
pub const MARKER: [u8; 4] = *b"MDX1";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReadError {
    #[error("cannot read data: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown encoding marker {0:?}")]
    UnknownMarker([u8; 4]),

    #[error("malformed data: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WriteError {
    #[error("cannot write data: {0}")]
    Io(#[from] std::io::Error),
}

/// The documentation payload stored per package.
#[derive(Clone, PartialEq, Eq, Debug, Default, serde::Serialize)]
pub struct DocPackage {
    pub name: String,
    pub doc: String,
    pub imports: Vec<String>,
    pub decls: Vec<DocDecl>,
}

#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize)]
pub struct DocDecl {
    pub kind: SymbolKind,
    pub name: String,
    pub signature: String,
    pub doc: String,
    /// Empty means the declaration exists in every build context.
    pub contexts: Vec<BuildContext>,
}

fn kind_tag(kind: SymbolKind) -> u8 {
    match kind {
        SymbolKind::Const => 0,
        SymbolKind::Var => 1,
        SymbolKind::Func => 2,
        SymbolKind::Type => 3,
        SymbolKind::Method => 4,
    }
}

fn kind_from_tag(tag: u8) -> Result<SymbolKind, ReadError> {
    Ok(match tag {
        0 => SymbolKind::Const,
        1 => SymbolKind::Var,
        2 => SymbolKind::Func,
        3 => SymbolKind::Type,
        4 => SymbolKind::Method,
        other => return Err(ReadError::Malformed(format!("unknown symbol tag {other}"))),
    })
}

fn context_tag(ctx: BuildContext) -> u8 {
    match ctx {
        BuildContext::LinuxAmd64 => 0,
        BuildContext::WindowsAmd64 => 1,
        BuildContext::DarwinAmd64 => 2,
        BuildContext::JsWasm => 3,
    }
}

fn context_from_tag(tag: u8) -> Result<BuildContext, ReadError> {
    Ok(match tag {
        0 => BuildContext::LinuxAmd64,
        1 => BuildContext::WindowsAmd64,
        2 => BuildContext::DarwinAmd64,
        3 => BuildContext::JsWasm,
        other => return Err(ReadError::Malformed(format!("unknown context tag {other}"))),
    })
}

/// Interning table built during encoding; indices are assigned in first-use
/// order, so encoding is deterministic.
#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
    index: rustc_hash::FxHashMap<String, u64>,
}

impl StringTable {
    fn intern(&mut self, s: &str) -> u64 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as u64;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }
}

/// Encode a package documentation payload.
pub fn encode_package(pkg: &DocPackage) -> Result<Vec<u8>, WriteError> {
    let mut table = StringTable::default();

    let name = table.intern(&pkg.name);
    let doc = table.intern(&pkg.doc);
    let imports: Vec<u64> = pkg.imports.iter().map(|s| table.intern(s)).collect();
    let decls: Vec<(u8, u64, u64, u64, Vec<u8>)> = pkg
        .decls
        .iter()
        .map(|d| {
            (
                kind_tag(d.kind),
                table.intern(&d.name),
                table.intern(&d.signature),
                table.intern(&d.doc),
                d.contexts.iter().map(|&c| context_tag(c)).collect(),
            )
        })
        .collect();

    let mut w = Vec::new();
    w.write_all(&MARKER)?;

    w.write_varint(table.strings.len() as u64)?;
    for s in &table.strings {
        w.write_varint(s.len() as u64)?;
        w.write_all(s.as_bytes())?;
    }

    w.write_varint(name)?;
    w.write_varint(doc)?;
    w.write_varint(imports.len() as u64)?;
    for i in imports {
        w.write_varint(i)?;
    }
    w.write_varint(decls.len() as u64)?;
    for (kind, name, sig, doc, ctxs) in decls {
        w.write_all(&[kind])?;
        w.write_varint(name)?;
        w.write_varint(sig)?;
        w.write_varint(doc)?;
        w.write_varint(ctxs.len() as u64)?;
        w.write_all(&ctxs)?;
    }

    Ok(w)
}

// Caps keep a corrupted length prefix from allocating unbounded memory.
const MAX_STRINGS: u64 = 1 << 20;
const MAX_STRING_LEN: u64 = 1 << 24;
const MAX_DECLS: u64 = 1 << 18;

fn read_len<R: Read>(r: &mut R, cap: u64, what: &str) -> Result<u64, ReadError> {
    let n: u64 = r.read_varint()?;
    if n > cap {
        return Err(ReadError::Malformed(format!("{what} count {n} exceeds {cap}")));
    }
    Ok(n)
}

/// Decode a package documentation payload.
pub fn decode_package(bytes: &[u8]) -> Result<DocPackage, ReadError> {
    let mut r = bytes;

    let mut marker = [0u8; 4];
    r.read_exact(&mut marker)?;
    if marker != MARKER {
        return Err(ReadError::UnknownMarker(marker));
    }

    let n = read_len(&mut r, MAX_STRINGS, "string")?;
    let mut strings = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        let len = read_len(&mut r, MAX_STRING_LEN, "string byte")?;
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf)?;
        strings.push(
            String::from_utf8(buf)
                .map_err(|e| ReadError::Malformed(format!("invalid utf-8: {e}")))?,
        );
    }

    let lookup = |i: u64| -> Result<String, ReadError> {
        strings
            .get(i as usize)
            .cloned()
            .ok_or_else(|| ReadError::Malformed(format!("string index {i} out of range")))
    };

    let name = lookup(r.read_varint()?)?;
    let doc = lookup(r.read_varint()?)?;

    let n = read_len(&mut r, MAX_STRINGS, "import")?;
    let mut imports = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        imports.push(lookup(r.read_varint()?)?);
    }

    let n = read_len(&mut r, MAX_DECLS, "decl")?;
    let mut decls = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        let kind = kind_from_tag(tag[0])?;
        let name = lookup(r.read_varint()?)?;
        let signature = lookup(r.read_varint()?)?;
        let doc = lookup(r.read_varint()?)?;
        let ctx_n = read_len(&mut r, 16, "context")?;
        let mut ctxs = vec![0u8; ctx_n as usize];
        r.read_exact(&mut ctxs)?;
        let contexts = ctxs
            .into_iter()
            .map(context_from_tag)
            .collect::<Result<Vec<_>, _>>()?;
        decls.push(DocDecl {
            kind,
            name,
            signature,
            doc,
            contexts,
        });
    }

    if !r.is_empty() {
        return Err(ReadError::Malformed(format!(
            "{} trailing bytes",
            r.len()
        )));
    }

    Ok(DocPackage {
        name,
        doc,
        imports,
        decls,
    })
}
