// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Module container: parsing and validation.
//!
//! A module is a 20-byte header followed by length-prefixed sections:
//!
//! ```text
//! magic "SGIL" | version:u32 | flags:u32 | reserved:u32 | crc32:u32
//! ( section_id:u8 | size:u32 | body[size] )*
//! ```
//!
//! The CRC-32 covers every byte after the header. Unknown section ids are
//! skipped for forward compatibility; known sections may appear at most once.
//! A [`Module`] owns its raw byte buffer; code bodies and data segments are
//! stored as ranges into it and resolved on use.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::format::{ReadError, Reader, crc32};
use crate::memory::PAGE_SIZE;
use crate::value::{Value, ValueType};

/// Container magic tag.
pub const MAGIC: [u8; 4] = *b"SGIL";
/// Container format version understood by this loader.
pub const VERSION: u32 = 1;
/// Header length in bytes.
pub const HEADER_LEN: usize = 20;

/// Maximum parameters per function type.
pub const MAX_PARAMS: usize = 16;
/// Maximum function count (imports + bodies).
pub const MAX_FUNCS: u32 = 4096;
/// Maximum type count.
pub const MAX_TYPES: u32 = 4096;
/// Maximum global count.
pub const MAX_GLOBALS: u32 = 1024;
/// Maximum export count.
pub const MAX_EXPORTS: u32 = 65536;
/// Maximum data segment count.
pub const MAX_DATA_SEGMENTS: u32 = 4096;
/// Register window size; `reg_count` declarations fit in a `u8`.
pub const REG_WINDOW: usize = 256;

/// Section identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionId {
    /// Function types.
    Type = 1,
    /// Host imports.
    Import = 2,
    /// Function descriptors.
    Func = 3,
    /// Linear memory limits.
    Memory = 4,
    /// Globals with initial values.
    Global = 5,
    /// Named exports.
    Export = 6,
    /// Function bodies.
    Code = 7,
    /// Data segments.
    Data = 8,
}

impl SectionId {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::Type,
            2 => Self::Import,
            3 => Self::Func,
            4 => Self::Memory,
            5 => Self::Global,
            6 => Self::Export,
            7 => Self::Code,
            8 => Self::Data,
            _ => return None,
        })
    }
}

/// An ordered parameter list plus at most one result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncType {
    /// Parameter types, at most [`MAX_PARAMS`].
    pub params: Vec<ValueType>,
    /// Result type, if any.
    pub result: Option<ValueType>,
}

/// A host import requirement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Import {
    /// Import module name.
    pub module: String,
    /// Import function name.
    pub name: String,
    /// Index into the type table.
    pub type_idx: u16,
}

/// A function: either an import stub or a bytecode body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// Index into the type table.
    pub type_idx: u16,
    /// Import stub or body.
    pub kind: FuncKind,
}

/// The two function flavors. Import indices occupy the low function-index
/// space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FuncKind {
    /// Dispatches to a registered host function.
    Import {
        /// Index into the import table.
        import_idx: u32,
    },
    /// A bytecode body.
    Body(FuncBody),
}

/// Metadata for a bytecode function body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncBody {
    /// Declared register count.
    pub reg_count: u8,
    /// Declared local count.
    pub local_count: u8,
    code_offset: usize,
    code_len: usize,
}

impl FuncBody {
    /// Code length in 32-bit words.
    #[must_use]
    pub fn code_words(&self) -> u32 {
        (self.code_len / 4) as u32
    }
}

/// A global template. VMs copy globals into a mutable array at init.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Global {
    /// Value type; restricted to the four numeric types.
    pub ty: ValueType,
    /// Whether guest code may overwrite it. Metadata only; `stglobal` is not
    /// type-checked.
    pub mutable: bool,
    /// Initial value.
    pub value: Value,
}

/// Export kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExportKind {
    /// A function export.
    Func = 0,
    /// The linear memory.
    Memory = 1,
    /// A global.
    Global = 2,
}

impl ExportKind {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Func,
            1 => Self::Memory,
            2 => Self::Global,
            _ => return None,
        })
    }
}

/// A named export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
    /// Export kind.
    pub kind: ExportKind,
    /// Index in the kind's index space.
    pub index: u32,
    /// Export name; unique per kind.
    pub name: String,
}

/// Linear memory limits in 64 KiB pages. `max_pages == 0` in the container
/// is normalized to `initial_pages` at parse time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryDesc {
    /// Initial page count.
    pub initial_pages: u32,
    /// Maximum page count (normalized, `>= initial_pages`).
    pub max_pages: u32,
}

/// A data segment applied once at instantiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSegment {
    /// Byte offset into linear memory.
    pub offset: u32,
    data_offset: usize,
    data_len: usize,
}

impl DataSegment {
    /// Segment length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data_len
    }

    /// Returns `true` for an empty segment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }
}

/// A module load failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// Input was shorter than required.
    Truncated,
    /// Magic tag mismatch.
    BadMagic,
    /// Unsupported container version.
    UnsupportedVersion {
        /// Version found in the header.
        found: u32,
    },
    /// Header CRC did not match the payload.
    ChecksumMismatch {
        /// CRC stored in the header.
        expected: u32,
        /// CRC computed over the payload.
        computed: u32,
    },
    /// A string was not valid UTF-8.
    InvalidString,
    /// A section consumed more bytes than its declared size.
    SectionOverrun {
        /// Offending section id byte.
        id: u8,
    },
    /// A known section appeared more than once.
    DuplicateSection {
        /// Offending section id byte.
        id: u8,
    },
    /// A count exceeded a container limit.
    LimitExceeded {
        /// What was counted.
        what: &'static str,
        /// The count found.
        count: u32,
        /// The limit.
        max: u32,
    },
    /// An unknown value type byte.
    BadValueType {
        /// The offending byte.
        byte: u8,
    },
    /// A function type declared more than one result.
    BadReturnCount {
        /// Declared result count.
        count: u8,
    },
    /// A type index referenced a nonexistent type.
    BadTypeIndex {
        /// The offending index.
        index: u16,
        /// Number of types in the module.
        types: u32,
    },
    /// CODE body count did not match FUNC body count.
    CodeCountMismatch {
        /// Bodies declared in the FUNC section.
        expected: u32,
        /// Bodies found in the CODE section.
        found: u32,
    },
    /// A code body size was not a multiple of 4.
    MisalignedCode {
        /// Body index within the CODE section.
        body: u32,
        /// Declared size in bytes.
        size: u32,
    },
    /// An unknown export kind byte.
    BadExportKind {
        /// The offending byte.
        byte: u8,
    },
    /// An export index was out of range for its kind.
    BadExportIndex {
        /// Export kind.
        kind: ExportKind,
        /// The offending index.
        index: u32,
    },
    /// Two exports of the same kind shared a name.
    DuplicateExport {
        /// The duplicated name.
        name: String,
    },
    /// Memory max pages was below initial pages.
    BadMemoryLimits {
        /// Declared initial pages.
        initial: u16,
        /// Declared max pages.
        max: u16,
    },
    /// A data segment did not fit in the initial memory.
    DataSegmentOutOfBounds {
        /// Segment offset.
        offset: u32,
        /// Segment length.
        len: u32,
        /// Initial memory size in bytes.
        memory: u64,
    },
    /// A global declared a non-numeric type.
    BadGlobalType {
        /// The offending type.
        ty: ValueType,
    },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated module"),
            Self::BadMagic => write!(f, "bad magic"),
            Self::UnsupportedVersion { found } => {
                write!(f, "unsupported version {found} (expected {VERSION})")
            }
            Self::ChecksumMismatch { expected, computed } => write!(
                f,
                "checksum mismatch (header {expected:#010x}, payload {computed:#010x})"
            ),
            Self::InvalidString => write!(f, "invalid string"),
            Self::SectionOverrun { id } => write!(f, "section {id} overran its declared size"),
            Self::DuplicateSection { id } => write!(f, "duplicate section {id}"),
            Self::LimitExceeded { what, count, max } => {
                write!(f, "too many {what}: {count} (max {max})")
            }
            Self::BadValueType { byte } => write!(f, "bad value type {byte:#04x}"),
            Self::BadReturnCount { count } => write!(f, "bad return count {count}"),
            Self::BadTypeIndex { index, types } => {
                write!(f, "type index {index} out of range ({types} types)")
            }
            Self::CodeCountMismatch { expected, found } => {
                write!(f, "code body count {found} (expected {expected})")
            }
            Self::MisalignedCode { body, size } => {
                write!(f, "code body {body} size {size} is not word-aligned")
            }
            Self::BadExportKind { byte } => write!(f, "bad export kind {byte}"),
            Self::BadExportIndex { kind, index } => {
                write!(f, "export index {index} out of range for {kind:?}")
            }
            Self::DuplicateExport { name } => write!(f, "duplicate export '{name}'"),
            Self::BadMemoryLimits { initial, max } => {
                write!(f, "memory max pages {max} below initial {initial}")
            }
            Self::DataSegmentOutOfBounds {
                offset,
                len,
                memory,
            } => write!(
                f,
                "data segment [{offset}, {offset}+{len}) outside initial memory of {memory} bytes"
            ),
            Self::BadGlobalType { ty } => write!(f, "global of non-numeric type {ty}"),
        }
    }
}

impl core::error::Error for LoadError {}

impl From<ReadError> for LoadError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::UnexpectedEof => Self::Truncated,
            ReadError::InvalidUtf8 => Self::InvalidString,
            ReadError::StringTooLong => Self::LimitExceeded {
                what: "string bytes",
                count: 0,
                max: crate::format::MAX_STR_LEN as u32,
            },
        }
    }
}

/// A validated, read-only parsed module.
///
/// The module owns the raw container bytes; code bodies and data segments
/// reference them by range so nothing is copied twice.
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    data: Vec<u8>,
    types: Vec<FuncType>,
    imports: Vec<Import>,
    funcs: Vec<Function>,
    globals: Vec<Global>,
    exports: Vec<Export>,
    memory: Option<MemoryDesc>,
    data_segments: Vec<DataSegment>,
    init_func: Option<u32>,
}

impl Module {
    /// Parses and validates a module from raw container bytes.
    ///
    /// The bytes are copied; no guest code runs.
    pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < HEADER_LEN {
            return Err(LoadError::Truncated);
        }
        if bytes[..4] != MAGIC {
            return Err(LoadError::BadMagic);
        }
        let mut hdr = Reader::new(&bytes[4..HEADER_LEN]);
        let version = hdr.read_u32()?;
        let _flags = hdr.read_u32()?;
        let _reserved = hdr.read_u32()?;
        let expected_crc = hdr.read_u32()?;
        if version != VERSION {
            return Err(LoadError::UnsupportedVersion { found: version });
        }
        let computed_crc = crc32(0, &bytes[HEADER_LEN..]);
        if computed_crc != expected_crc {
            return Err(LoadError::ChecksumMismatch {
                expected: expected_crc,
                computed: computed_crc,
            });
        }

        let mut parser = Parser::default();
        let mut r = Reader::new(&bytes[HEADER_LEN..]);
        while r.remaining() > 0 {
            let id = r.read_u8()?;
            let size = r.read_u32()? as usize;
            let start = r.offset();
            match SectionId::from_u8(id) {
                Some(section) => {
                    parser.claim(section)?;
                    parser.parse(section, &mut r)?;
                    let consumed = r.offset() - start;
                    if consumed > size {
                        return Err(LoadError::SectionOverrun { id });
                    }
                    // A short read pads to the declared length.
                    r.skip(size - consumed)?;
                }
                None => r.skip(size)?,
            }
        }

        let mut module = parser.finish()?;
        // Offsets were recorded relative to the payload; rebase onto the
        // owned buffer, which keeps the header.
        module.data = bytes.to_vec();
        Ok(module)
    }

    /// Function types.
    #[must_use]
    pub fn types(&self) -> &[FuncType] {
        &self.types
    }

    /// Host imports, in function-index order.
    #[must_use]
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    /// All functions: imports first, then bodies.
    #[must_use]
    pub fn functions(&self) -> &[Function] {
        &self.funcs
    }

    /// Looks up a function by index.
    #[must_use]
    pub fn func(&self, index: u32) -> Option<&Function> {
        self.funcs.get(index as usize)
    }

    /// The function type of `func`, if both indices are valid.
    #[must_use]
    pub fn func_type(&self, index: u32) -> Option<&FuncType> {
        let f = self.func(index)?;
        self.types.get(usize::from(f.type_idx))
    }

    /// Global templates.
    #[must_use]
    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    /// Named exports.
    #[must_use]
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// Looks up an exported function index by name.
    #[must_use]
    pub fn export_func(&self, name: &str) -> Option<u32> {
        self.exports
            .iter()
            .find(|e| e.kind == ExportKind::Func && e.name == name)
            .map(|e| e.index)
    }

    /// Memory limits, if the module declares a memory.
    #[must_use]
    pub fn memory(&self) -> Option<MemoryDesc> {
        self.memory
    }

    /// Data segments.
    #[must_use]
    pub fn data_segments(&self) -> &[DataSegment] {
        &self.data_segments
    }

    /// Bytes of a data segment.
    #[must_use]
    pub fn segment_bytes(&self, seg: &DataSegment) -> &[u8] {
        &self.data[seg.data_offset..seg.data_offset + seg.data_len]
    }

    /// Code bytes of a function body (word-aligned length).
    #[must_use]
    pub fn code(&self, body: &FuncBody) -> &[u8] {
        &self.data[body.code_offset..body.code_offset + body.code_len]
    }

    /// Index of the function exported as `_init`, if declared.
    #[must_use]
    pub fn init_func(&self) -> Option<u32> {
        self.init_func
    }

    /// Number of imports (the low function-index space).
    #[must_use]
    pub fn import_count(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Total function count, imports included.
    #[must_use]
    pub fn func_count(&self) -> u32 {
        self.funcs.len() as u32
    }
}

/// Section-parsing state. Offsets recorded here are payload-relative and get
/// rebased by [`Module::load`].
#[derive(Default)]
struct Parser {
    seen: [bool; 9],
    types: Vec<FuncType>,
    imports: Vec<Import>,
    func_decls: Vec<(u16, u8, u8)>,
    codes: Vec<(usize, usize)>,
    saw_code: bool,
    globals: Vec<Global>,
    exports: Vec<Export>,
    memory: Option<MemoryDesc>,
    data_segments: Vec<DataSegment>,
}

impl Parser {
    fn claim(&mut self, section: SectionId) -> Result<(), LoadError> {
        let slot = &mut self.seen[section as usize];
        if *slot {
            return Err(LoadError::DuplicateSection { id: section as u8 });
        }
        *slot = true;
        Ok(())
    }

    fn parse(&mut self, section: SectionId, r: &mut Reader<'_>) -> Result<(), LoadError> {
        match section {
            SectionId::Type => self.parse_types(r),
            SectionId::Import => self.parse_imports(r),
            SectionId::Func => self.parse_funcs(r),
            SectionId::Memory => self.parse_memory(r),
            SectionId::Global => self.parse_globals(r),
            SectionId::Export => self.parse_exports(r),
            SectionId::Code => self.parse_code(r),
            SectionId::Data => self.parse_data(r),
        }
    }

    fn parse_types(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_u32()?;
        if count > MAX_TYPES {
            return Err(LoadError::LimitExceeded {
                what: "types",
                count,
                max: MAX_TYPES,
            });
        }
        for _ in 0..count {
            let param_count = r.read_u8()?;
            let return_count = r.read_u8()?;
            if usize::from(param_count) > MAX_PARAMS {
                return Err(LoadError::LimitExceeded {
                    what: "parameters",
                    count: u32::from(param_count),
                    max: MAX_PARAMS as u32,
                });
            }
            if return_count > 1 {
                return Err(LoadError::BadReturnCount {
                    count: return_count,
                });
            }
            let mut params = Vec::with_capacity(usize::from(param_count));
            for _ in 0..param_count {
                params.push(read_value_type(r)?);
            }
            let result = if return_count == 1 {
                Some(read_value_type(r)?)
            } else {
                None
            };
            self.types.push(FuncType { params, result });
        }
        Ok(())
    }

    fn parse_imports(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_u32()?;
        if count > MAX_FUNCS {
            return Err(LoadError::LimitExceeded {
                what: "imports",
                count,
                max: MAX_FUNCS,
            });
        }
        for _ in 0..count {
            let module = String::from(r.read_str8()?);
            let name = String::from(r.read_str8()?);
            let type_idx = r.read_u16()?;
            self.imports.push(Import {
                module,
                name,
                type_idx,
            });
        }
        Ok(())
    }

    fn parse_funcs(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let body_count = r.read_u32()?;
        let total = (self.imports.len() as u32).saturating_add(body_count);
        if total > MAX_FUNCS {
            return Err(LoadError::LimitExceeded {
                what: "functions",
                count: total,
                max: MAX_FUNCS,
            });
        }
        for _ in 0..body_count {
            let type_idx = r.read_u16()?;
            let reg_count = r.read_u8()?;
            let local_count = r.read_u8()?;
            self.func_decls.push((type_idx, reg_count, local_count));
        }
        Ok(())
    }

    fn parse_memory(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let initial = r.read_u16()?;
        let max = r.read_u16()?;
        if max != 0 && max < initial {
            return Err(LoadError::BadMemoryLimits { initial, max });
        }
        let max_pages = if max == 0 { initial } else { max };
        self.memory = Some(MemoryDesc {
            initial_pages: u32::from(initial),
            max_pages: u32::from(max_pages),
        });
        Ok(())
    }

    fn parse_globals(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_u32()?;
        if count > MAX_GLOBALS {
            return Err(LoadError::LimitExceeded {
                what: "globals",
                count,
                max: MAX_GLOBALS,
            });
        }
        for _ in 0..count {
            let ty = read_value_type(r)?;
            let mutable = r.read_u8()? != 0;
            let raw = r.read_u64()?;
            if !ty.is_numeric() {
                return Err(LoadError::BadGlobalType { ty });
            }
            let value = match ty {
                ValueType::I32 => Value::I32(raw as u32 as i32),
                ValueType::I64 => Value::I64(raw as i64),
                ValueType::F32 => Value::F32(f32::from_bits(raw as u32)),
                ValueType::F64 => Value::F64(f64::from_bits(raw)),
                _ => unreachable!(),
            };
            self.globals.push(Global { ty, mutable, value });
        }
        Ok(())
    }

    fn parse_exports(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_u32()?;
        if count > MAX_EXPORTS {
            return Err(LoadError::LimitExceeded {
                what: "exports",
                count,
                max: MAX_EXPORTS,
            });
        }
        for _ in 0..count {
            let kind_byte = r.read_u8()?;
            let kind =
                ExportKind::from_u8(kind_byte).ok_or(LoadError::BadExportKind { byte: kind_byte })?;
            let index = r.read_u32()?;
            let name = String::from(r.read_str8()?);
            self.exports.push(Export { kind, index, name });
        }
        Ok(())
    }

    fn parse_code(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        self.saw_code = true;
        let count = r.read_u32()?;
        let expected = self.func_decls.len() as u32;
        if count != expected {
            return Err(LoadError::CodeCountMismatch {
                expected,
                found: count,
            });
        }
        for i in 0..count {
            let size = r.read_u32()?;
            if size % 4 != 0 {
                return Err(LoadError::MisalignedCode { body: i, size });
            }
            let offset = r.offset();
            r.read_bytes(size as usize)?;
            self.codes.push((offset, size as usize));
        }
        Ok(())
    }

    fn parse_data(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_u32()?;
        if count > MAX_DATA_SEGMENTS {
            return Err(LoadError::LimitExceeded {
                what: "data segments",
                count,
                max: MAX_DATA_SEGMENTS,
            });
        }
        for _ in 0..count {
            let _mem_idx = r.read_u8()?;
            let offset = r.read_u32()?;
            let size = r.read_u32()?;
            let data_offset = r.offset();
            r.read_bytes(size as usize)?;
            self.data_segments.push(DataSegment {
                offset,
                data_offset,
                data_len: size as usize,
            });
        }
        Ok(())
    }

    /// Cross-section validation and assembly into a [`Module`].
    fn finish(self) -> Result<Module, LoadError> {
        let type_count = self.types.len() as u32;
        for imp in &self.imports {
            if u32::from(imp.type_idx) >= type_count {
                return Err(LoadError::BadTypeIndex {
                    index: imp.type_idx,
                    types: type_count,
                });
            }
        }
        if !self.func_decls.is_empty() && !self.saw_code {
            return Err(LoadError::CodeCountMismatch {
                expected: self.func_decls.len() as u32,
                found: 0,
            });
        }

        let mut funcs = Vec::with_capacity(self.imports.len() + self.func_decls.len());
        for (i, imp) in self.imports.iter().enumerate() {
            funcs.push(Function {
                type_idx: imp.type_idx,
                kind: FuncKind::Import {
                    import_idx: i as u32,
                },
            });
        }
        for (i, &(type_idx, reg_count, local_count)) in self.func_decls.iter().enumerate() {
            if u32::from(type_idx) >= type_count {
                return Err(LoadError::BadTypeIndex {
                    index: type_idx,
                    types: type_count,
                });
            }
            let (code_offset, code_len) = self.codes[i];
            funcs.push(Function {
                type_idx,
                kind: FuncKind::Body(FuncBody {
                    reg_count,
                    local_count,
                    code_offset: HEADER_LEN + code_offset,
                    code_len,
                }),
            });
        }

        let func_count = funcs.len() as u32;
        let global_count = self.globals.len() as u32;
        for (i, e) in self.exports.iter().enumerate() {
            let valid = match e.kind {
                ExportKind::Func => e.index < func_count,
                ExportKind::Memory => e.index == 0 && self.memory.is_some(),
                ExportKind::Global => e.index < global_count,
            };
            if !valid {
                return Err(LoadError::BadExportIndex {
                    kind: e.kind,
                    index: e.index,
                });
            }
            if self.exports[..i]
                .iter()
                .any(|p| p.kind == e.kind && p.name == e.name)
            {
                return Err(LoadError::DuplicateExport {
                    name: e.name.clone(),
                });
            }
        }

        let memory_bytes = self
            .memory
            .map_or(0u64, |m| u64::from(m.initial_pages) * PAGE_SIZE as u64);
        for seg in &self.data_segments {
            let end = u64::from(seg.offset) + seg.data_len as u64;
            if end > memory_bytes {
                return Err(LoadError::DataSegmentOutOfBounds {
                    offset: seg.offset,
                    len: seg.data_len as u32,
                    memory: memory_bytes,
                });
            }
        }

        let init_func = self
            .exports
            .iter()
            .find(|e| e.kind == ExportKind::Func && e.name == "_init")
            .map(|e| e.index);

        Ok(Module {
            data: Vec::new(),
            types: self.types,
            imports: self.imports,
            funcs,
            globals: self.globals,
            exports: self.exports,
            memory: self.memory,
            data_segments: self
                .data_segments
                .into_iter()
                .map(|s| DataSegment {
                    offset: s.offset,
                    data_offset: HEADER_LEN + s.data_offset,
                    data_len: s.data_len,
                })
                .collect(),
            init_func,
        })
    }
}

fn read_value_type(r: &mut Reader<'_>) -> Result<ValueType, LoadError> {
    let b = r.read_u8()?;
    ValueType::from_u8(b).ok_or(LoadError::BadValueType { byte: b })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{Asm, ModuleBuilder};
    use crate::opcode::Opcode;

    fn add_module() -> Vec<u8> {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[ValueType::I32, ValueType::I32], Some(ValueType::I32));
        let mut a = Asm::new();
        a.op(Opcode::Add32, 0, 0, 1);
        a.op(Opcode::Ret, 0, 0, 0);
        let f = b.func(ty, 4, 0, a).unwrap();
        b.export_func(f, "add");
        b.finish()
    }

    #[test]
    fn load_roundtrips_builder_output() {
        let bytes = add_module();
        let m = Module::load(&bytes).unwrap();
        assert_eq!(m.types().len(), 1);
        assert_eq!(m.func_count(), 1);
        assert_eq!(m.import_count(), 0);
        assert_eq!(m.export_func("add"), Some(0));
        assert_eq!(m.export_func("sub"), None);
        assert!(m.init_func().is_none());
        let FuncKind::Body(body) = &m.func(0).unwrap().kind else {
            panic!("expected body");
        };
        assert_eq!(body.code_words(), 2);
        assert_eq!(m.code(body).len(), 8);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = add_module();
        bytes[0] = b'X';
        assert_eq!(Module::load(&bytes), Err(LoadError::BadMagic));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = add_module();
        bytes[4] = 9;
        assert!(matches!(
            Module::load(&bytes),
            Err(LoadError::UnsupportedVersion { found: 9 })
        ));
    }

    #[test]
    fn rejects_flipped_payload_bit() {
        let mut bytes = add_module();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x10;
        assert!(matches!(
            Module::load(&bytes),
            Err(LoadError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = add_module();
        assert_eq!(Module::load(&bytes[..10]), Err(LoadError::Truncated));
    }

    #[test]
    fn skips_unknown_sections() {
        // Append an unknown section and re-seal the checksum.
        let mut bytes = add_module();
        bytes.extend_from_slice(&[0x7E]);
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        let crc = crate::format::crc32(0, &bytes[HEADER_LEN..]);
        bytes[16..20].copy_from_slice(&crc.to_le_bytes());
        let m = Module::load(&bytes).unwrap();
        assert_eq!(m.export_func("add"), Some(0));
    }

    #[test]
    fn detects_init_export() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], None);
        let mut a = Asm::new();
        a.op(Opcode::Ret, 0, 0, 0);
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "_init");
        let m = Module::load(&b.finish()).unwrap();
        assert_eq!(m.init_func(), Some(0));
    }

    #[test]
    fn rejects_duplicate_export_names() {
        let mut b = ModuleBuilder::new();
        let ty = b.ty(&[], None);
        let mut a = Asm::new();
        a.op(Opcode::Ret, 0, 0, 0);
        let f = b.func(ty, 1, 0, a).unwrap();
        b.export_func(f, "go");
        b.export_func(f, "go");
        assert!(matches!(
            Module::load(&b.finish()),
            Err(LoadError::DuplicateExport { .. })
        ));
    }

    #[test]
    fn rejects_oversized_data_segment() {
        let mut b = ModuleBuilder::new();
        b.memory(1, 1);
        b.data(PAGE_SIZE as u32 - 2, &[1, 2, 3, 4]);
        assert!(matches!(
            Module::load(&b.finish()),
            Err(LoadError::DataSegmentOutOfBounds { .. })
        ));
    }

    #[test]
    fn rejects_bad_type_index_on_import() {
        let mut b = ModuleBuilder::new();
        b.import("env", "missing", 7);
        assert!(matches!(
            Module::load(&b.finish()),
            Err(LoadError::BadTypeIndex { index: 7, .. })
        ));
    }

    #[test]
    fn normalizes_zero_max_pages() {
        let mut b = ModuleBuilder::new();
        b.memory(3, 0);
        let m = Module::load(&b.finish()).unwrap();
        assert_eq!(
            m.memory(),
            Some(MemoryDesc {
                initial_pages: 3,
                max_pages: 3
            })
        );
    }
}
