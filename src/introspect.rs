//! Answers three questions about a compiled module without instantiating it:
//! which WASI ABI generation it targets, whether it carries the Asyncify
//! stack-switching transformation, and how much linear memory it expects to
//! import.
//!
//! ABI and Asyncify detection enumerate imports/exports through `wasmparser`.
//! The memory limits are decoded by a narrow hand-rolled cursor instead,
//! because enumeration surfaces the import's existence but the host also
//! needs the limit values to size the memory it creates. All three
//! operations degrade to a conservative answer on malformed input; a binary
//! that cannot be classified must still get a chance to load.

use thiserror::Error;
use wasmparser::{Encoding, Parser, Payload};

/// Which generation of the WASI ABI a module's imports name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasiAbi {
    /// Flat function imports from `wasi_snapshot_preview1`.
    Preview1,
    /// Component-model interfaces under the `wasi:` namespace.
    Preview2,
}

pub const PREVIEW1_MODULE: &str = "wasi_snapshot_preview1";
pub const PREVIEW2_PREFIX: &str = "wasi:";

const ASYNCIFY_MARKER: &str = "asyncify";

/// Import/export names matching the Asyncify transformation, recorded per
/// side. The trampoline is engaged when the exports are present.
#[derive(Debug, Default)]
pub struct AsyncifySupport {
    pub import_names: Vec<String>,
    pub export_names: Vec<String>,
}

impl AsyncifySupport {
    pub fn in_imports(&self) -> bool {
        !self.import_names.is_empty()
    }

    pub fn in_exports(&self) -> bool {
        !self.export_names.is_empty()
    }
}

/// Page counts declared by a module's memory import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLimits {
    pub initial: u64,
    pub maximum: Option<u64>,
}

/// Hard ceiling on 32-bit memories, in 64 KiB pages.
pub(crate) const MAX_MEMORY_PAGES: u64 = 65536;

// Used when a memory import is present but its limits cannot be decoded.
// Loading with more memory than needed beats refusing to load.
const FALLBACK_IMPORT_PAGES: u64 = 128;

/// Classify which WASI ABI the module targets, or `None` when its imports
/// are not WASI-shaped. Scans imports in declared order; the first
/// WASI-shaped module name wins. Never fails: unparseable input is `None`.
pub fn classify_abi(bytes: &[u8]) -> Option<WasiAbi> {
    let walk = || -> anyhow::Result<Option<WasiAbi>> {
        for payload in Parser::new(0).parse_all(bytes) {
            match payload? {
                // the component encoding is the Preview-2 vehicle
                Payload::Version {
                    encoding: Encoding::Component,
                    ..
                } => return Ok(Some(WasiAbi::Preview2)),
                Payload::ImportSection(section) => {
                    for import in section {
                        let import = import?;
                        if import.module == PREVIEW1_MODULE {
                            return Ok(Some(WasiAbi::Preview1));
                        }
                        if import.module.starts_with(PREVIEW2_PREFIX) {
                            return Ok(Some(WasiAbi::Preview2));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    };
    match walk() {
        Ok(abi) => abi,
        Err(e) => {
            tracing::debug!("ABI classification failed, proceeding unclassified: {e:#}");
            None
        }
    }
}

/// Record every import and export name carrying the Asyncify marker. Never
/// fails: unparseable input yields the empty descriptor.
pub fn detect_asyncify(bytes: &[u8]) -> AsyncifySupport {
    let walk = || -> anyhow::Result<AsyncifySupport> {
        let mut support = AsyncifySupport::default();
        for payload in Parser::new(0).parse_all(bytes) {
            match payload? {
                Payload::ImportSection(section) => {
                    for import in section {
                        let import = import?;
                        if import.name.contains(ASYNCIFY_MARKER) {
                            support.import_names.push(import.name.to_string());
                        }
                    }
                }
                Payload::ExportSection(section) => {
                    for export in section {
                        let export = export?;
                        if export.name.contains(ASYNCIFY_MARKER) {
                            support.export_names.push(export.name.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(support)
    };
    match walk() {
        Ok(support) => support,
        Err(e) => {
            tracing::debug!("asyncify detection failed, assuming plain module: {e:#}");
            AsyncifySupport::default()
        }
    }
}

/// Decode the limits of the module's `namespace`/`"memory"` import.
///
/// `None` means the module declares no such import (defaults never apply to
/// absence). A module that declares the import but whose limit encoding
/// cannot be decoded yields the conservative fallback size instead.
pub fn detect_memory_import(bytes: &[u8], namespace: &str) -> Option<MemoryLimits> {
    match walk_import_section(bytes, namespace) {
        Ok(found) => found,
        Err(e) => {
            tracing::debug!("memory import scan failed, assuming none: {e}");
            None
        }
    }
}

fn walk_import_section(
    bytes: &[u8],
    namespace: &str,
) -> Result<Option<MemoryLimits>, ReadError> {
    let mut r = BinaryReader::new(bytes);
    if r.read_bytes(4)? != b"\0asm" || r.read_u32()? != 1 {
        return Err(ReadError::BadHeader);
    }
    while !r.is_empty() {
        let id = r.read_u8()?;
        let size = r.read_varu32()? as usize;
        if id != IMPORT_SECTION {
            r.skip(size)?;
            continue;
        }
        let count = r.read_varu32()?;
        for _ in 0..count {
            let module = r.read_name()?;
            let name = r.read_name()?;
            match r.read_u8()? {
                KIND_FUNC => {
                    r.read_varu32()?;
                }
                KIND_TABLE => {
                    r.read_u8()?;
                    read_limits(&mut r)?;
                }
                KIND_MEMORY => {
                    if module == namespace && name == "memory" {
                        // the import is confirmed; a bad limit encoding
                        // degrades rather than failing the load
                        return Ok(Some(read_limits(&mut r).unwrap_or(MemoryLimits {
                            initial: FALLBACK_IMPORT_PAGES,
                            maximum: None,
                        })));
                    }
                    read_limits(&mut r)?;
                }
                KIND_GLOBAL => {
                    r.read_u8()?;
                    r.read_u8()?;
                }
                KIND_TAG => {
                    r.read_u8()?;
                    r.read_varu32()?;
                }
                _ => return Err(ReadError::BadImportKind),
            }
        }
        // a well-formed module has a single import section
        return Ok(None);
    }
    Ok(None)
}

const IMPORT_SECTION: u8 = 2;
const KIND_FUNC: u8 = 0;
const KIND_TABLE: u8 = 1;
const KIND_MEMORY: u8 = 2;
const KIND_GLOBAL: u8 = 3;
const KIND_TAG: u8 = 4;

fn read_limits(r: &mut BinaryReader<'_>) -> Result<MemoryLimits, ReadError> {
    let flags = r.read_u8()?;
    let wide = flags & 0x04 != 0;
    let initial = if wide {
        r.read_varu64()?
    } else {
        u64::from(r.read_varu32()?)
    };
    let maximum = if flags & 0x01 != 0 {
        let max = if wide {
            r.read_varu64()?
        } else {
            u64::from(r.read_varu32()?)
        };
        Some(max.min(MAX_MEMORY_PAGES))
    } else {
        None
    };
    Ok(MemoryLimits { initial, maximum })
}

/// Whether `bytes` uses the component encoding. The loader needs this to
/// pick between the component bridge and core-module instantiation when a
/// binary classifies as Preview 2.
pub(crate) fn is_component(bytes: &[u8]) -> bool {
    matches!(
        Parser::new(0).parse_all(bytes).next(),
        Some(Ok(Payload::Version {
            encoding: Encoding::Component,
            ..
        }))
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum ReadError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("integer representation too long")]
    IntegerTooLong,
    #[error("bad magic number or version")]
    BadHeader,
    #[error("malformed import entry")]
    BadImportKind,
    #[error("malformed name")]
    BadName,
}

/// Minimal binary cursor over the module encoding: position, byte reads,
/// and the 7-bits-per-byte variable-length unsigned integers used for all
/// sizes and counts.
pub(crate) struct BinaryReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        BinaryReader { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(ReadError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u32(&mut self) -> Result<u32, ReadError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        let end = self.pos.checked_add(len).ok_or(ReadError::UnexpectedEof)?;
        let bytes = self
            .bytes
            .get(self.pos..end)
            .ok_or(ReadError::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ReadError> {
        self.read_bytes(len)?;
        Ok(())
    }

    pub fn read_name(&mut self) -> Result<&'a str, ReadError> {
        let len = self.read_varu32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| ReadError::BadName)
    }

    /// Unsigned LEB128, capped at 32 significant bits. An encoding carrying
    /// more is a hard error, never a silent truncation.
    pub fn read_varu32(&mut self) -> Result<u32, ReadError> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 28 && byte & 0xf0 != 0 {
                return Err(ReadError::IntegerTooLong);
            }
            result |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Unsigned LEB128, capped at 64 significant bits.
    pub fn read_varu64(&mut self) -> Result<u64, ReadError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte & 0xfe != 0 {
                return Err(ReadError::IntegerTooLong);
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // -- cursor ----------------------------------------------------------

    #[test]
    fn varu32_decodes_exact_values_and_lengths() {
        for (encoding, value) in [
            (&[0x00u8][..], 0u32),
            (&[0x7f][..], 127),
            (&[0x80, 0x01][..], 128),
            (&[0x80, 0x80, 0x01][..], 16384),
            (&[0xff, 0xff, 0xff, 0xff, 0x0f][..], u32::MAX),
        ] {
            let mut r = BinaryReader::new(encoding);
            assert_eq!(r.read_varu32().unwrap(), value);
            assert_eq!(r.position(), encoding.len(), "consumed bytes for {value}");
        }
    }

    #[test]
    fn varu32_rejects_more_than_32_significant_bits() {
        // 33rd bit set
        let mut r = BinaryReader::new(&[0xff, 0xff, 0xff, 0xff, 0x1f]);
        assert_eq!(r.read_varu32().unwrap_err(), ReadError::IntegerTooLong);
        // over-long continuation, even for a zero value
        let mut r = BinaryReader::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]);
        assert_eq!(r.read_varu32().unwrap_err(), ReadError::IntegerTooLong);
    }

    #[test]
    fn varu32_eof_mid_encoding() {
        let mut r = BinaryReader::new(&[0x80]);
        assert_eq!(r.read_varu32().unwrap_err(), ReadError::UnexpectedEof);
    }

    // -- hand-built modules ----------------------------------------------
    //
    // Minimal byte sequences with only the import section varied, per the
    // binary format: magic, version, then `(section-id, size, payload)`.

    fn varu32(out: &mut Vec<u8>, mut v: u32) {
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
    }

    fn name(out: &mut Vec<u8>, s: &str) {
        varu32(out, s.len() as u32);
        out.extend_from_slice(s.as_bytes());
    }

    enum Desc<'a> {
        Func,
        Memory { limits: &'a [u8] },
    }

    fn module_with_imports(entries: &[(&str, &str, Desc<'_>)]) -> Vec<u8> {
        let mut payload = Vec::new();
        varu32(&mut payload, entries.len() as u32);
        for (module, field, desc) in entries {
            name(&mut payload, module);
            name(&mut payload, field);
            match desc {
                Desc::Func => {
                    payload.push(KIND_FUNC);
                    varu32(&mut payload, 0);
                }
                Desc::Memory { limits } => {
                    payload.push(KIND_MEMORY);
                    payload.extend_from_slice(limits);
                }
            }
        }

        let mut module = b"\0asm\x01\0\0\0".to_vec();
        if !entries.is_empty() {
            // a function import needs a type section to refer to
            module.extend_from_slice(&[0x01, 0x04, 0x01, 0x60, 0x00, 0x00]);
            module.push(IMPORT_SECTION);
            varu32(&mut module, payload.len() as u32);
            module.extend_from_slice(&payload);
        }
        module
    }

    #[test]
    fn classification_is_deterministic() {
        let p1 = module_with_imports(&[("wasi_snapshot_preview1", "proc_exit", Desc::Func)]);
        assert_eq!(classify_abi(&p1), Some(WasiAbi::Preview1));

        let p2 = module_with_imports(&[("wasi:cli/run@0.2.0", "run", Desc::Func)]);
        assert_eq!(classify_abi(&p2), Some(WasiAbi::Preview2));

        let none = module_with_imports(&[("env", "emscripten_get_now", Desc::Func)]);
        assert_eq!(classify_abi(&none), None);

        let empty = module_with_imports(&[]);
        assert_eq!(classify_abi(&empty), None);
    }

    #[test]
    fn classification_takes_first_match_in_declared_order() {
        let mixed = module_with_imports(&[
            ("wasi:sockets/tcp@0.2.0", "connect", Desc::Func),
            ("wasi_snapshot_preview1", "fd_write", Desc::Func),
        ]);
        assert_eq!(classify_abi(&mixed), Some(WasiAbi::Preview2));
    }

    #[test]
    fn classification_never_fails_on_garbage() {
        assert_eq!(classify_abi(b"not a wasm module"), None);
        assert_eq!(classify_abi(&[]), None);
    }

    #[test]
    fn memory_import_round_trips_limits() {
        // flags 0x01: maximum present; initial=2, maximum=4
        let m = module_with_imports(&[(
            "env",
            "memory",
            Desc::Memory {
                limits: &[0x01, 0x02, 0x04],
            },
        )]);
        assert_eq!(
            detect_memory_import(&m, "env"),
            Some(MemoryLimits {
                initial: 2,
                maximum: Some(4)
            })
        );

        // flags 0x00: no maximum; initial=17
        let m = module_with_imports(&[(
            "env",
            "memory",
            Desc::Memory {
                limits: &[0x00, 0x11],
            },
        )]);
        assert_eq!(
            detect_memory_import(&m, "env"),
            Some(MemoryLimits {
                initial: 17,
                maximum: None
            })
        );
    }

    #[test]
    fn memory_import_absent_is_none_not_default() {
        let m = module_with_imports(&[("env", "emscripten_get_now", Desc::Func)]);
        assert_eq!(detect_memory_import(&m, "env"), None);
        // present, but under a different namespace
        let m = module_with_imports(&[(
            "other",
            "memory",
            Desc::Memory {
                limits: &[0x00, 0x01],
            },
        )]);
        assert_eq!(detect_memory_import(&m, "env"), None);
        assert_eq!(
            detect_memory_import(&m, "other"),
            Some(MemoryLimits {
                initial: 1,
                maximum: None
            })
        );
    }

    #[test]
    fn memory_import_maximum_is_capped() {
        // maximum 100000 pages exceeds the 32-bit ceiling of 65536
        let mut limits = vec![0x01, 0x02];
        varu32(&mut limits, 100_000);
        let m = module_with_imports(&[("env", "memory", Desc::Memory { limits: &limits })]);
        assert_eq!(
            detect_memory_import(&m, "env"),
            Some(MemoryLimits {
                initial: 2,
                maximum: Some(MAX_MEMORY_PAGES)
            })
        );
    }

    #[test]
    fn memory_import_bad_limits_degrade_to_fallback() {
        // flags byte claims a maximum that is not there
        let m = module_with_imports(&[(
            "env",
            "memory",
            Desc::Memory {
                limits: &[0x01, 0x02],
            },
        )]);
        assert_eq!(
            detect_memory_import(&m, "env"),
            Some(MemoryLimits {
                initial: FALLBACK_IMPORT_PAGES,
                maximum: None
            })
        );
    }

    #[test]
    fn asyncify_detection_by_name_substring() {
        let plain = wat::parse_str("(module (func (export \"_start\")))").unwrap();
        let support = detect_asyncify(&plain);
        assert!(!support.in_imports() && !support.in_exports());

        let transformed = wat::parse_str(
            r#"(module
                (global $s (mut i32) (i32.const 0))
                (func (export "asyncify_get_state") (result i32) (global.get $s))
                (func (export "asyncify_start_unwind") (param i32))
                (func (export "asyncify_stop_unwind"))
                (func (export "asyncify_start_rewind") (param i32))
                (func (export "asyncify_stop_rewind"))
                (func (export "_start")))"#,
        )
        .unwrap();
        let support = detect_asyncify(&transformed);
        assert!(support.in_exports());
        assert!(!support.in_imports());
        assert_eq!(support.export_names.len(), 5);

        let importer = wat::parse_str(
            r#"(module (import "env" "asyncify_start_unwind" (func (param i32))))"#,
        )
        .unwrap();
        assert!(detect_asyncify(&importer).in_imports());
    }
}
