// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host-call ABI and the per-VM host function registry.
//!
//! Guest code reaches the embedder through imports: each `(module, name)`
//! pair the module declares must be bound to a [`HostFunc`] before
//! [`Vm::init`]. Host calls are synchronous and run on the calling thread;
//! they receive the VM's linear memory and the staged argument values, and
//! return a single value (or [`Value::Void`]).
//!
//! [`Vm::init`]: crate::vm::Vm::init

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;

use crate::memory::LinearMemory;
use crate::value::Value;

/// An error returned by a host function. The reason string is propagated
/// verbatim into the VM's last-error message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostError {
    /// Human-readable failure reason.
    pub reason: String,
}

impl HostError {
    /// Creates a host error with `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host error: {}", self.reason)
    }
}

impl core::error::Error for HostError {}

/// A host function callable from guest code.
///
/// Implemented for any `FnMut(&mut LinearMemory, &[Value]) -> Result<Value,
/// HostError>` closure; captured state replaces the C-style user pointer.
/// Hosts get the linear memory (the sanctioned side channel for bulk data)
/// but not the VM itself, so re-entrant calls are impossible by construction.
pub trait HostFunc {
    /// Performs the host call.
    fn call(&mut self, memory: &mut LinearMemory, args: &[Value]) -> Result<Value, HostError>;
}

impl<F> HostFunc for F
where
    F: FnMut(&mut LinearMemory, &[Value]) -> Result<Value, HostError>,
{
    fn call(&mut self, memory: &mut LinearMemory, args: &[Value]) -> Result<Value, HostError> {
        self(memory, args)
    }
}

/// A registry of host functions keyed by `(module, name)`.
///
/// Registration is last-wins: re-registering a name replaces the previous
/// callback. Lookup resolves to a stable slot index so the interpreter can
/// dispatch without hashing.
#[derive(Default)]
pub struct HostRegistry {
    index: HashMap<(String, String), usize>,
    fns: Vec<Box<dyn HostFunc>>,
}

impl HostRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `(module, name)`, replacing any previous entry.
    pub fn register(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        f: Box<dyn HostFunc>,
    ) {
        let key = (module.into(), name.into());
        match self.index.get(&key) {
            Some(&slot) => self.fns[slot] = f,
            None => {
                let slot = self.fns.len();
                self.fns.push(f);
                self.index.insert(key, slot);
            }
        }
    }

    /// Resolves `(module, name)` to a dispatch slot.
    #[must_use]
    pub fn lookup(&self, module: &str, name: &str) -> Option<usize> {
        // Keyed by owned strings; probe with a transient key. Registration
        // volume is tiny, so the allocation here is irrelevant.
        self.index
            .get(&(String::from(module), String::from(name)))
            .copied()
    }

    /// Returns the host function at `slot`.
    pub fn get_mut(&mut self, slot: usize) -> &mut dyn HostFunc {
        &mut *self.fns[slot]
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fns.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("len", &self.fns.len())
            .finish_non_exhaustive()
    }
}
