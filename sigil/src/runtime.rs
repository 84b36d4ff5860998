// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The top-level embedding handle.
//!
//! A [`Runtime`] loads modules and instantiates VMs. Modules are handed out
//! as `Arc<Module>` so the free-ordering rules take care of themselves: a
//! module stays alive as long as any VM references it, and dropping the
//! runtime never invalidates live instances.

use alloc::sync::Arc;

use crate::module::{LoadError, Module};
use crate::vm::{Config, Vm};

/// The container-of-modules handle embedders start from.
#[derive(Clone, Copy, Debug, Default)]
pub struct Runtime;

impl Runtime {
    /// Creates a runtime.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parses and validates a module from raw bytes. No guest code runs.
    pub fn load(&self, bytes: &[u8]) -> Result<Arc<Module>, LoadError> {
        Module::load(bytes).map(Arc::new)
    }

    /// Creates an uninitialized VM bound to `module`.
    ///
    /// Call [`Vm::register`] for each import, then [`Vm::init`].
    #[must_use]
    pub fn instantiate(&self, module: &Arc<Module>, cfg: Config) -> Vm {
        Vm::new(Arc::clone(module), cfg)
    }
}
