// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Module assembler.
//!
//! [`Asm`] builds one function body as a stream of instruction words without
//! hand-computing branch offsets: branch targets are [`Label`]s, placed with
//! [`Asm::place`] and resolved when the body is attached to a
//! [`ModuleBuilder`]. The builder assembles the full container (header,
//! sections, checksum) that [`Module::load`] accepts.
//!
//! This is the crate's producer side; tests, tools, and embedders use it to
//! construct modules without a separate toolchain.
//!
//! [`Module::load`]: crate::module::Module::load

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::format::{Writer, crc32};
use crate::module::{ExportKind, FuncType, HEADER_LEN, MAGIC, SectionId, VERSION};
use crate::opcode::Opcode;
use crate::value::{Value, ValueType};

/// A control-flow target within one [`Asm`] body.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Label(usize);

/// An assembly failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AsmError {
    /// A label was referenced but never placed.
    UnresolvedLabel,
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedLabel => write!(f, "label was referenced but never placed"),
        }
    }
}

impl core::error::Error for AsmError {}

/// A single function body under construction.
#[derive(Clone, Debug, Default)]
pub struct Asm {
    words: Vec<u32>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl Asm {
    /// Creates an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position in words.
    #[must_use]
    pub fn position(&self) -> u32 {
        self.words.len() as u32
    }

    /// Emits a raw 32-bit word. Escape hatch for malformed-code tests.
    pub fn raw_word(&mut self, w: u32) {
        self.words.push(w);
    }

    /// Emits `(op, dst, s1, s2)`.
    pub fn op(&mut self, op: Opcode, dst: u8, s1: u8, s2: u8) {
        self.words.push(
            u32::from(op.byte())
                | (u32::from(dst) << 8)
                | (u32::from(s1) << 16)
                | (u32::from(s2) << 24),
        );
    }

    /// Emits `(op, dst, s1, s2)` followed by one immediate word.
    pub fn op_imm(&mut self, op: Opcode, dst: u8, s1: u8, s2: u8, imm: u32) {
        self.op(op, dst, s1, s2);
        self.words.push(imm);
    }

    /// Emits `(op, dst, s1, s2)` followed by two immediate words (low, high).
    pub fn op_imm64(&mut self, op: Opcode, dst: u8, s1: u8, s2: u8, imm: u64) {
        self.op(op, dst, s1, s2);
        self.words.push(imm as u32);
        self.words.push((imm >> 32) as u32);
    }

    /// `R[dst] = imm`.
    pub fn ldi32(&mut self, dst: u8, v: i32) {
        self.op_imm(Opcode::Ldi32, dst, 0, 0, v as u32);
    }

    /// `R[dst] = imm` (64-bit).
    pub fn ldi64(&mut self, dst: u8, v: i64) {
        self.op_imm64(Opcode::Ldi64, dst, 0, 0, v as u64);
    }

    /// `R[dst] = imm` (bit-exact f32).
    pub fn ldf32(&mut self, dst: u8, v: f32) {
        self.op_imm(Opcode::Ldf32, dst, 0, 0, v.to_bits());
    }

    /// `R[dst] = imm` (bit-exact f64).
    pub fn ldf64(&mut self, dst: u8, v: f64) {
        self.op_imm64(Opcode::Ldf64, dst, 0, 0, v.to_bits());
    }

    /// `R[dst] = R[src]`.
    pub fn mov(&mut self, dst: u8, src: u8) {
        self.op(Opcode::Mov, dst, src, 0);
    }

    /// Return with `R[0]` as the result.
    pub fn ret(&mut self) {
        self.op(Opcode::Ret, 0, 0, 0);
    }

    /// `R[dst] = globals[index]`.
    pub fn ldglobal(&mut self, dst: u8, index: u32) {
        self.op_imm(Opcode::Ldglobal, dst, 0, 0, index);
    }

    /// `globals[index] = R[src]`.
    pub fn stglobal(&mut self, src: u8, index: u32) {
        self.op_imm(Opcode::Stglobal, 0, src, 0, index);
    }

    /// Stages `R[src]` into argument slot `slot`.
    pub fn arg(&mut self, slot: u8, src: u8) {
        self.op(Opcode::Arg, slot, src, 0);
    }

    /// Calls function `func`; the result lands in `R[dst]`.
    pub fn call(&mut self, dst: u8, func: u32) {
        self.op_imm(Opcode::Call, dst, 0, 0, func);
    }

    /// Calls import `import`; the result lands in `R[dst]`.
    pub fn call_host(&mut self, dst: u8, import: u32) {
        self.op_imm(Opcode::CallHost, dst, 0, 0, import);
    }

    /// `R[dst] = mem32[R[base] + offset]`.
    pub fn load32(&mut self, dst: u8, base: u8, offset: u32) {
        self.op_imm(Opcode::Load32, dst, base, 0, offset);
    }

    /// `mem32[R[base] + offset] = R[src]`.
    pub fn store32(&mut self, src: u8, base: u8, offset: u32) {
        self.op_imm(Opcode::Store32, src, base, 0, offset);
    }

    /// Creates an unplaced label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Places `label` at the current position.
    pub fn place(&mut self, label: Label) {
        self.labels[label.0] = Some(self.position());
    }

    fn branch(&mut self, op: Opcode, s1: u8, s2: u8, target: Label) {
        self.op(op, 0, s1, s2);
        self.fixups.push((self.words.len(), target));
        self.words.push(0);
    }

    /// Unconditional jump to `target`.
    pub fn jmp(&mut self, target: Label) {
        self.branch(Opcode::Jmp, 0, 0, target);
    }

    /// Branch to `target` if `R[cond]` is zero.
    pub fn jz(&mut self, cond: u8, target: Label) {
        self.branch(Opcode::Jz, cond, 0, target);
    }

    /// Branch to `target` if `R[cond]` is nonzero.
    pub fn jnz(&mut self, cond: u8, target: Label) {
        self.branch(Opcode::Jnz, cond, 0, target);
    }

    /// Branch to `target` if `R[a] < R[b]` (signed i32).
    pub fn jlt(&mut self, a: u8, b: u8, target: Label) {
        self.branch(Opcode::Jlt, a, b, target);
    }

    /// Branch to `target` if `R[a] <= R[b]` (signed i32).
    pub fn jle(&mut self, a: u8, b: u8, target: Label) {
        self.branch(Opcode::Jle, a, b, target);
    }

    /// Resolves labels and returns the final word stream.
    ///
    /// Branch offsets are relative to the word after the immediate.
    pub fn finish(mut self) -> Result<Vec<u32>, AsmError> {
        for &(imm_index, label) in &self.fixups {
            let Some(target) = self.labels[label.0] else {
                return Err(AsmError::UnresolvedLabel);
            };
            let after_imm = imm_index as i64 + 1;
            let offset = i64::from(target) - after_imm;
            self.words[imm_index] = offset as i32 as u32;
        }
        Ok(self.words)
    }
}

/// Declares and assembles a whole module container.
///
/// Imports must be declared before bodies so that import indices occupy the
/// low function-index space.
#[derive(Clone, Debug, Default)]
pub struct ModuleBuilder {
    types: Vec<FuncType>,
    imports: Vec<(String, String, u16)>,
    decls: Vec<(u16, u8, u8)>,
    codes: Vec<Vec<u32>>,
    memory: Option<(u16, u16)>,
    globals: Vec<(ValueType, bool, u64)>,
    exports: Vec<(ExportKind, u32, String)>,
    data: Vec<(u32, Vec<u8>)>,
}

impl ModuleBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a function type and returns its index.
    pub fn ty(&mut self, params: &[ValueType], result: Option<ValueType>) -> u16 {
        self.types.push(FuncType {
            params: params.to_vec(),
            result,
        });
        (self.types.len() - 1) as u16
    }

    /// Declares an import and returns its function index.
    pub fn import(&mut self, module: &str, name: &str, ty: u16) -> u32 {
        debug_assert!(
            self.decls.is_empty(),
            "imports must precede function bodies"
        );
        self.imports.push((String::from(module), String::from(name), ty));
        (self.imports.len() - 1) as u32
    }

    /// Attaches a function body and returns its function index.
    pub fn func(
        &mut self,
        ty: u16,
        reg_count: u8,
        local_count: u8,
        body: Asm,
    ) -> Result<u32, AsmError> {
        let words = body.finish()?;
        self.decls.push((ty, reg_count, local_count));
        self.codes.push(words);
        Ok((self.imports.len() + self.decls.len() - 1) as u32)
    }

    /// Declares the linear memory. `max = 0` means "same as initial".
    pub fn memory(&mut self, initial: u16, max: u16) {
        self.memory = Some((initial, max));
    }

    /// Declares a global and returns its index.
    pub fn global(&mut self, ty: ValueType, mutable: bool, value: Value) -> u32 {
        let raw = match ty {
            ValueType::I64 => value.as_i64() as u64,
            ValueType::F32 => u64::from(value.as_f32().to_bits()),
            ValueType::F64 => value.as_f64().to_bits(),
            _ => value.as_i32() as u32 as u64,
        };
        self.globals.push((ty, mutable, raw));
        (self.globals.len() - 1) as u32
    }

    /// Exports function `index` under `name`.
    pub fn export_func(&mut self, index: u32, name: &str) {
        self.exports
            .push((ExportKind::Func, index, String::from(name)));
    }

    /// Exports the linear memory under `name`.
    pub fn export_memory(&mut self, name: &str) {
        self.exports.push((ExportKind::Memory, 0, String::from(name)));
    }

    /// Exports global `index` under `name`.
    pub fn export_global(&mut self, index: u32, name: &str) {
        self.exports
            .push((ExportKind::Global, index, String::from(name)));
    }

    /// Adds a data segment copied into memory at instantiation.
    pub fn data(&mut self, offset: u32, bytes: &[u8]) {
        self.data.push((offset, bytes.to_vec()));
    }

    /// Assembles the container: header, sections in canonical order, and the
    /// checksum over everything after the header.
    #[must_use]
    pub fn finish(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_bytes(&MAGIC);
        w.write_u32(VERSION);
        w.write_u32(0); // flags
        w.write_u32(0); // reserved
        w.write_u32(0); // crc32, patched below

        if !self.types.is_empty() {
            let mut body = Writer::new();
            body.write_u32(self.types.len() as u32);
            for t in &self.types {
                body.write_u8(t.params.len() as u8);
                body.write_u8(u8::from(t.result.is_some()));
                for &p in &t.params {
                    body.write_u8(p as u8);
                }
                if let Some(res) = t.result {
                    body.write_u8(res as u8);
                }
            }
            write_section(&mut w, SectionId::Type, &body);
        }

        if !self.imports.is_empty() {
            let mut body = Writer::new();
            body.write_u32(self.imports.len() as u32);
            for (module, name, ty) in &self.imports {
                body.write_str8(module);
                body.write_str8(name);
                body.write_u16(*ty);
            }
            write_section(&mut w, SectionId::Import, &body);
        }

        if !self.decls.is_empty() {
            let mut body = Writer::new();
            body.write_u32(self.decls.len() as u32);
            for &(ty, regs, locals) in &self.decls {
                body.write_u16(ty);
                body.write_u8(regs);
                body.write_u8(locals);
            }
            write_section(&mut w, SectionId::Func, &body);
        }

        if let Some((initial, max)) = self.memory {
            let mut body = Writer::new();
            body.write_u16(initial);
            body.write_u16(max);
            write_section(&mut w, SectionId::Memory, &body);
        }

        if !self.globals.is_empty() {
            let mut body = Writer::new();
            body.write_u32(self.globals.len() as u32);
            for &(ty, mutable, raw) in &self.globals {
                body.write_u8(ty as u8);
                body.write_u8(u8::from(mutable));
                body.write_u64(raw);
            }
            write_section(&mut w, SectionId::Global, &body);
        }

        if !self.exports.is_empty() {
            let mut body = Writer::new();
            body.write_u32(self.exports.len() as u32);
            for (kind, index, name) in &self.exports {
                body.write_u8(*kind as u8);
                body.write_u32(*index);
                body.write_str8(name);
            }
            write_section(&mut w, SectionId::Export, &body);
        }

        if !self.decls.is_empty() {
            let mut body = Writer::new();
            body.write_u32(self.codes.len() as u32);
            for code in &self.codes {
                body.write_u32((code.len() * 4) as u32);
                for &word in code {
                    body.write_u32(word);
                }
            }
            write_section(&mut w, SectionId::Code, &body);
        }

        if !self.data.is_empty() {
            let mut body = Writer::new();
            body.write_u32(self.data.len() as u32);
            for (offset, bytes) in &self.data {
                body.write_u8(0); // mem_idx
                body.write_u32(*offset);
                body.write_u32(bytes.len() as u32);
                body.write_bytes(bytes);
            }
            write_section(&mut w, SectionId::Data, &body);
        }

        let crc = crc32(0, &w.as_slice()[HEADER_LEN..]);
        let mut out = w;
        out.patch_u32(16, crc);
        out.into_vec()
    }
}

fn write_section(w: &mut Writer, id: SectionId, body: &Writer) {
    w.write_u8(id as u8);
    w.write_u32(body.len() as u32);
    w.write_bytes(body.as_slice());
}
