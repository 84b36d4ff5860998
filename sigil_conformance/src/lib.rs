// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end conformance suite for the sigil runtime.
//!
//! The actual tests live in `tests/conformance.rs`.
