// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tracing hooks.
//!
//! Tracing is optional and no_std-friendly: the VM emits only the events a
//! [`TraceSink`] asks for via its [`TraceMask`]. Use [`Vm::call_traced`] to
//! drive a sink; the plain [`Vm::call`] path pays nothing.
//!
//! [`Vm::call`]: crate::vm::Vm::call
//! [`Vm::call_traced`]: crate::vm::Vm::call_traced

/// A set of trace events requested by a [`TraceSink`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraceMask(u32);

impl core::ops::BitOr for TraceMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for TraceMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl TraceMask {
    /// No tracing.
    pub const NONE: Self = Self(0);
    /// Emit [`TraceEvent::CallEnter`] and [`TraceEvent::CallExit`] for
    /// bytecode call frames.
    pub const CALL: Self = Self(1 << 0);
    /// Emit [`TraceEvent::Instr`] for each dispatched instruction.
    pub const INSTR: Self = Self(1 << 1);
    /// Emit [`TraceEvent::HostCall`] for host dispatches.
    pub const HOST: Self = Self(1 << 2);

    /// Returns `true` if this mask includes all bits in `other`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// A trace event emitted by the VM.
#[derive(Clone, Debug)]
pub enum TraceEvent<'a> {
    /// A bytecode frame was entered.
    CallEnter {
        /// Function index.
        func: u32,
        /// Stack depth after entering.
        depth: usize,
    },
    /// A bytecode frame was exited (return or trap unwind).
    CallExit {
        /// Function index.
        func: u32,
        /// Stack depth before exiting.
        depth: usize,
    },
    /// One instruction dispatch.
    Instr {
        /// Function index.
        func: u32,
        /// Program counter (words) of the instruction.
        pc: u32,
        /// The opcode byte.
        opcode: u8,
    },
    /// A host function dispatch.
    HostCall {
        /// Import module name.
        module: &'a str,
        /// Import function name.
        name: &'a str,
        /// Number of staged arguments.
        args: usize,
    },
}

/// A sink that receives VM trace events.
pub trait TraceSink {
    /// The set of events this sink wants.
    fn mask(&self) -> TraceMask {
        TraceMask::NONE
    }

    /// Receives one event.
    fn event(&mut self, event: TraceEvent<'_>);
}
