// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Criterion benchmarks for the sigil runtime. See `benches/vm.rs`.
