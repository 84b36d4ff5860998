// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `sigil`: an embeddable plugin runtime.
//!
//! Sigil loads compact bytecode modules from bytes, validates them
//! (CRC-checked, section-based container), resolves host-provided functions,
//! and executes exported functions inside a bounded sandbox: paged linear
//! memory, a bounded call stack, and optional instruction-count ("fuel")
//! limits. Guest code is untrusted; every fault becomes a typed error, never
//! an escape.
//!
//! ## Example
//!
//! ```
//! extern crate alloc;
//!
//! use sigil::asm::{Asm, ModuleBuilder};
//! use sigil::opcode::Opcode;
//! use sigil::runtime::Runtime;
//! use sigil::value::{Value, ValueType};
//! use sigil::vm::Config;
//!
//! // fn add(a: i32, b: i32) -> i32 { a + b }
//! let mut b = ModuleBuilder::new();
//! let ty = b.ty(&[ValueType::I32, ValueType::I32], Some(ValueType::I32));
//! let mut a = Asm::new();
//! a.op(Opcode::Add32, 0, 0, 1);
//! a.ret();
//! let f = b.func(ty, 4, 0, a)?;
//! b.export_func(f, "add");
//!
//! let rt = Runtime::new();
//! let module = rt.load(&b.finish())?;
//! let mut vm = rt.instantiate(&module, Config::default());
//! vm.init()?;
//! let out = vm.call("add", &[Value::I32(10), Value::I32(32)])?;
//! assert_eq!(out, Value::I32(42));
//! # Ok::<(), alloc::boxed::Box<dyn core::error::Error>>(())
//! ```

#![no_std]

extern crate alloc;

pub mod asm;
pub mod disasm;
pub mod error;
pub mod format;
pub mod host;
pub mod memory;
pub mod module;
pub mod opcode;
pub mod runtime;
pub(crate) mod stack;
pub mod trace;
pub mod value;
pub mod vm;
