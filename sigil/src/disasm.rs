// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Code-body disassembly for tooling and `inspect` output.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write as _;

use crate::module::{FuncKind, Module};
use crate::opcode::Opcode;

/// Renders one code body (raw little-endian words) to text, one instruction
/// per line. Unknown opcodes and truncated immediates are rendered rather
/// than rejected; the disassembler is a viewer, not a validator.
#[must_use]
pub fn disasm_body(code: &[u8]) -> String {
    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let mut out = String::new();
    let mut pc = 0usize;
    while pc < words.len() {
        let w = words[pc];
        let op_byte = (w & 0xFF) as u8;
        let dst = (w >> 8) & 0xFF;
        let s1 = (w >> 16) & 0xFF;
        let s2 = w >> 24;
        let _ = write!(out, "{pc:5}: ");
        match Opcode::from_u8(op_byte) {
            Some(op) => {
                let _ = write!(out, "{:<10} d{dst} s{s1} s{s2}", op.mnemonic());
                pc += 1;
                for _ in 0..op.imm_words() {
                    match words.get(pc) {
                        Some(&imm) => {
                            let _ = write!(out, " #{imm:#010x}");
                            pc += 1;
                        }
                        None => {
                            let _ = write!(out, " <truncated>");
                            pc = words.len();
                        }
                    }
                }
            }
            None => {
                let _ = write!(out, "db {op_byte:#04x} ({w:#010x})");
                pc += 1;
            }
        }
        out.push('\n');
    }
    out
}

/// Disassembles function `index` of `module`. Returns `None` for imports and
/// out-of-range indices.
#[must_use]
pub fn disasm_function(module: &Module, index: u32) -> Option<String> {
    match &module.func(index)?.kind {
        FuncKind::Import { .. } => None,
        FuncKind::Body(body) => Some(disasm_body(module.code(body))),
    }
}
