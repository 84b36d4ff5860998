// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Paged linear memory.
//!
//! Memory is allocated up front to `max_pages` and zero-filled; the current
//! size is tracked as a page count. Every access is bounds-checked against
//! the *current* size — there is no clamping, an out-of-range access fails.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// Bytes per linear-memory page.
pub const PAGE_SIZE: usize = 65536;

/// A failed bounds check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutOfBounds {
    /// Accessed offset.
    pub offset: u32,
    /// Access length in bytes.
    pub len: u32,
    /// Current memory size in bytes.
    pub size: u64,
}

impl fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory access [{:#x}, {:#x}+{}) out of bounds (size {})",
            self.offset, self.offset, self.len, self.size
        )
    }
}

impl core::error::Error for OutOfBounds {}

/// Bounds-checked paged linear memory owned by one VM.
#[derive(Clone, Debug)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    pages: u32,
    max_pages: u32,
}

impl LinearMemory {
    /// A zero-page memory for modules that declare none. Every access traps.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            bytes: Vec::new(),
            pages: 0,
            max_pages: 0,
        }
    }

    /// Allocates `max_pages` zeroed pages with `initial_pages` current.
    #[must_use]
    pub fn new(initial_pages: u32, max_pages: u32) -> Self {
        debug_assert!(initial_pages <= max_pages);
        Self {
            bytes: vec![0; max_pages as usize * PAGE_SIZE],
            pages: initial_pages,
            max_pages,
        }
    }

    /// Current page count.
    #[must_use]
    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Maximum page count.
    #[must_use]
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Current size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pages as usize * PAGE_SIZE
    }

    /// The currently accessible bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.size()]
    }

    /// The currently accessible bytes, mutably.
    ///
    /// The slice is invalidated by [`LinearMemory::grow`]; callers must not
    /// hold it across a grow.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let size = self.size();
        &mut self.bytes[..size]
    }

    fn check(&self, offset: u32, len: usize) -> Result<usize, OutOfBounds> {
        let end = u64::from(offset) + len as u64;
        if end > self.size() as u64 {
            return Err(OutOfBounds {
                offset,
                len: len as u32,
                size: self.size() as u64,
            });
        }
        Ok(offset as usize)
    }

    /// Copies `dst.len()` bytes out of memory starting at `offset`.
    pub fn read(&self, offset: u32, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        let start = self.check(offset, dst.len())?;
        dst.copy_from_slice(&self.bytes[start..start + dst.len()]);
        Ok(())
    }

    /// Copies `src` into memory starting at `offset`.
    pub fn write(&mut self, offset: u32, src: &[u8]) -> Result<(), OutOfBounds> {
        let start = self.check(offset, src.len())?;
        self.bytes[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Loads `N` little-endian bytes at `offset`.
    pub fn load<const N: usize>(&self, offset: u32) -> Result<[u8; N], OutOfBounds> {
        let start = self.check(offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[start..start + N]);
        Ok(out)
    }

    /// Stores `N` little-endian bytes at `offset`.
    pub fn store<const N: usize>(&mut self, offset: u32, bytes: [u8; N]) -> Result<(), OutOfBounds> {
        let start = self.check(offset, N)?;
        self.bytes[start..start + N].copy_from_slice(&bytes);
        Ok(())
    }

    /// `memmove` semantics: copies `len` bytes from `src` to `dst`, both
    /// bounds-checked. Overlapping ranges are handled.
    pub fn copy(&mut self, dst: u32, src: u32, len: u32) -> Result<(), OutOfBounds> {
        let d = self.check(dst, len as usize)?;
        let s = self.check(src, len as usize)?;
        self.bytes.copy_within(s..s + len as usize, d);
        Ok(())
    }

    /// Fills `len` bytes at `dst` with the low byte of `value`.
    pub fn fill(&mut self, dst: u32, value: u8, len: u32) -> Result<(), OutOfBounds> {
        let d = self.check(dst, len as usize)?;
        self.bytes[d..d + len as usize].fill(value);
        Ok(())
    }

    /// Adds `delta` pages. Returns the previous page count, or `-1` if the
    /// result would exceed `max_pages`. Newly added pages are zeroed.
    pub fn grow(&mut self, delta: u32) -> i32 {
        let Some(new_pages) = self.pages.checked_add(delta) else {
            return -1;
        };
        if new_pages > self.max_pages {
            return -1;
        }
        let prev = self.pages;
        self.bytes[prev as usize * PAGE_SIZE..new_pages as usize * PAGE_SIZE].fill(0);
        self.pages = new_pages;
        prev as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_memory_traps_everything() {
        let mut m = LinearMemory::empty();
        assert_eq!(m.size(), 0);
        assert!(m.load::<1>(0).is_err());
        assert!(m.write(0, &[1]).is_err());
        assert_eq!(m.grow(1), -1);
    }

    #[test]
    fn store_load_roundtrip() {
        let mut m = LinearMemory::new(1, 1);
        m.store(100, 12345u32.to_le_bytes()).unwrap();
        let got = u32::from_le_bytes(m.load(100).unwrap());
        assert_eq!(got, 12345);
    }

    #[test]
    fn bounds_are_exact() {
        let mut m = LinearMemory::new(1, 2);
        // Last valid 4-byte slot in a 1-page memory.
        assert!(m.store(PAGE_SIZE as u32 - 4, [1u8, 2, 3, 4]).is_ok());
        let err = m.store(PAGE_SIZE as u32 - 3, [0u8; 4]).unwrap_err();
        assert_eq!(err.size, PAGE_SIZE as u64);
        // Reads beyond the current pages trap even though the buffer
        // extends to max_pages.
        assert!(m.load::<1>(PAGE_SIZE as u32).is_err());
    }

    #[test]
    fn grow_is_monotonic_and_zeroing() {
        let mut m = LinearMemory::new(1, 3);
        assert_eq!(m.grow(1), 1);
        assert_eq!(m.pages(), 2);
        // The grown page is readable and zeroed.
        assert_eq!(m.load::<4>(PAGE_SIZE as u32).unwrap(), [0; 4]);
        // Exceeding max leaves the page count unchanged.
        assert_eq!(m.grow(2), -1);
        assert_eq!(m.pages(), 2);
        assert_eq!(m.grow(1), 2);
        assert_eq!(m.pages(), 3);
    }

    #[test]
    fn copy_handles_overlap() {
        let mut m = LinearMemory::new(1, 1);
        m.write(0, &[1, 2, 3, 4, 5]).unwrap();
        m.copy(2, 0, 5).unwrap();
        let mut out = [0u8; 7];
        m.read(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn fill_is_bounds_checked() {
        let mut m = LinearMemory::new(1, 1);
        m.fill(10, 0xAB, 4).unwrap();
        assert_eq!(m.load::<4>(10).unwrap(), [0xAB; 4]);
        assert!(m.fill(PAGE_SIZE as u32 - 1, 0, 2).is_err());
    }
}
