// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error surface.
//!
//! Runtime failures are rich sum types carrying their context ([`VmError`],
//! [`LoadError`], [`HostError`]); each collapses to the closed flat
//! [`ErrorCode`] enum for embedders that only want a code and a stable
//! string.
//!
//! [`LoadError`]: crate::module::LoadError
//! [`HostError`]: crate::host::HostError

use alloc::string::String;
use core::fmt;

use crate::host::HostError;
use crate::memory::OutOfBounds;
use crate::module::LoadError;

/// The closed error-code enum forming the embedding ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// Malformed module or misused lifecycle.
    BadModule,
    /// Container magic mismatch.
    BadMagic,
    /// Container version mismatch.
    Version,
    /// Out of memory / memory limit exceeded.
    Oom,
    /// Memory (or index) access out of bounds.
    Bounds,
    /// Integer division or remainder by zero.
    DivZero,
    /// Type or arity mismatch at the call boundary.
    Type,
    /// Export not found.
    NoExport,
    /// Unresolved import.
    NoImport,
    /// Call stack overflow.
    StackOverflow,
    /// Explicit trap instruction.
    Trap,
    /// Fuel exhausted.
    Fuel,
    /// Unknown opcode.
    BadOpcode,
    /// Propagated host-callback failure.
    HostError,
}

impl ErrorCode {
    /// Stable human-readable string for this code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadModule => "bad module",
            Self::BadMagic => "bad magic",
            Self::Version => "version mismatch",
            Self::Oom => "out of memory",
            Self::Bounds => "memory out of bounds",
            Self::DivZero => "division by zero",
            Self::Type => "type mismatch",
            Self::NoExport => "export not found",
            Self::NoImport => "unresolved import",
            Self::StackOverflow => "call stack overflow",
            Self::Trap => "trap",
            Self::Fuel => "fuel exhausted",
            Self::BadOpcode => "unknown opcode",
            Self::HostError => "host error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime failure: instantiation errors, guest traps, and resource
/// exhaustion. Variants carry enough context to format a useful diagnostic;
/// [`VmError::code`] collapses to the flat ABI code.
#[derive(Clone, Debug, PartialEq)]
pub enum VmError {
    /// The VM has not been initialized.
    NotInitialized,
    /// `init` or `register` was called after initialization.
    AlreadyInitialized,
    /// An import had no registered host function at init.
    UnresolvedImport {
        /// Import module name.
        module: String,
        /// Import function name.
        name: String,
    },
    /// The named function export does not exist.
    NoSuchExport {
        /// The requested name.
        name: String,
    },
    /// Argument count did not match the export's declared parameters.
    ArityMismatch {
        /// Export name.
        name: String,
        /// Declared parameter count.
        expected: usize,
        /// Provided argument count.
        actual: usize,
    },
    /// `max_pages * 64 KiB` exceeded the configured memory limit.
    MemoryLimitExceeded {
        /// Bytes the module's memory requires.
        need: u64,
        /// Configured limit in bytes.
        limit: u64,
    },
    /// Call depth hit the configured stack size.
    StackOverflow {
        /// Configured frame limit.
        limit: usize,
    },
    /// A guest memory access failed its bounds check.
    MemoryOutOfBounds(OutOfBounds),
    /// Integer division or remainder by zero.
    DivideByZero {
        /// Function index.
        func: u32,
        /// Program counter (words) of the instruction.
        pc: u32,
    },
    /// The guest executed `trap`.
    ExplicitTrap {
        /// Function index.
        func: u32,
        /// Program counter (words) of the instruction.
        pc: u32,
    },
    /// An unknown opcode byte was fetched.
    BadOpcode {
        /// The opcode byte.
        opcode: u8,
        /// Function index.
        func: u32,
        /// Program counter (words) of the instruction.
        pc: u32,
    },
    /// An instruction's immediate words ran past the end of the body.
    TruncatedCode {
        /// Function index.
        func: u32,
        /// Program counter (words) where the stream ended.
        pc: u32,
    },
    /// A call targeted a nonexistent function index.
    BadFunctionIndex {
        /// The offending index.
        index: u32,
    },
    /// A host call targeted a nonexistent import index.
    BadImportIndex {
        /// The offending index.
        index: u32,
    },
    /// A global index was out of range.
    BadGlobalIndex {
        /// The offending index.
        index: u32,
    },
    /// An `arg` staging slot was out of range.
    BadArgSlot {
        /// The offending slot.
        slot: u8,
    },
    /// The per-call instruction budget ran out.
    FuelExhausted {
        /// Configured fuel limit.
        limit: u64,
    },
    /// A host callback failed; the reason is propagated verbatim.
    Host(HostError),
}

impl VmError {
    /// The flat ABI code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized | Self::AlreadyInitialized => ErrorCode::BadModule,
            Self::UnresolvedImport { .. } | Self::BadImportIndex { .. } => ErrorCode::NoImport,
            Self::NoSuchExport { .. } => ErrorCode::NoExport,
            Self::ArityMismatch { .. } => ErrorCode::Type,
            Self::MemoryLimitExceeded { .. } => ErrorCode::Oom,
            Self::StackOverflow { .. } => ErrorCode::StackOverflow,
            Self::MemoryOutOfBounds(_) | Self::BadGlobalIndex { .. } | Self::BadArgSlot { .. } => {
                ErrorCode::Bounds
            }
            Self::DivideByZero { .. } => ErrorCode::DivZero,
            Self::ExplicitTrap { .. } => ErrorCode::Trap,
            Self::BadOpcode { .. } => ErrorCode::BadOpcode,
            Self::TruncatedCode { .. } | Self::BadFunctionIndex { .. } => ErrorCode::BadModule,
            Self::FuelExhausted { .. } => ErrorCode::Fuel,
            Self::Host(_) => ErrorCode::HostError,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "VM not initialized, call init first"),
            Self::AlreadyInitialized => write!(f, "VM already initialized"),
            Self::UnresolvedImport { module, name } => {
                write!(f, "unresolved import: {module}::{name}")
            }
            Self::NoSuchExport { name } => write!(f, "export not found: {name}"),
            Self::ArityMismatch {
                name,
                expected,
                actual,
            } => write!(f, "{name} takes {expected} arguments, got {actual}"),
            Self::MemoryLimitExceeded { need, limit } => {
                write!(f, "memory limit exceeded ({need} bytes needed, limit {limit})")
            }
            Self::StackOverflow { limit } => write!(f, "call stack overflow (limit {limit})"),
            Self::MemoryOutOfBounds(e) => write!(f, "{e}"),
            Self::DivideByZero { func, pc } => {
                write!(f, "division by zero in function {func} at pc {pc}")
            }
            Self::ExplicitTrap { func, pc } => {
                write!(f, "explicit trap in function {func} at pc {pc}")
            }
            Self::BadOpcode { opcode, func, pc } => {
                write!(f, "unknown opcode {opcode:#04x} at func {func} pc {pc}")
            }
            Self::TruncatedCode { func, pc } => {
                write!(f, "truncated instruction in function {func} at pc {pc}")
            }
            Self::BadFunctionIndex { index } => write!(f, "call to invalid function {index}"),
            Self::BadImportIndex { index } => write!(f, "host call to invalid import {index}"),
            Self::BadGlobalIndex { index } => write!(f, "global index {index} out of range"),
            Self::BadArgSlot { slot } => write!(f, "argument slot {slot} out of range"),
            Self::FuelExhausted { limit } => write!(f, "fuel limit exceeded ({limit})"),
            Self::Host(e) => write!(f, "{e}"),
        }
    }
}

impl core::error::Error for VmError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Host(e) => Some(e),
            Self::MemoryOutOfBounds(e) => Some(e),
            _ => None,
        }
    }
}

impl From<OutOfBounds> for VmError {
    fn from(e: OutOfBounds) -> Self {
        Self::MemoryOutOfBounds(e)
    }
}

impl From<HostError> for VmError {
    fn from(e: HostError) -> Self {
        Self::Host(e)
    }
}

impl LoadError {
    /// The flat ABI code for this load failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadMagic => ErrorCode::BadMagic,
            Self::UnsupportedVersion { .. } => ErrorCode::Version,
            _ => ErrorCode::BadModule,
        }
    }
}
