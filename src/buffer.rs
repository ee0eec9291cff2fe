//! Type-erased scatter/gather buffer views (spec component A, §6).
//!
//! Mirrors the teacher's own `iovec`/`buf` modules in spirit (a thin wrapper
//! letting callers pass one buffer or many without the I/O layer caring),
//! but generalized to the fixed fan-out cap spec §6 calls for: "the
//! implementation caps the fan-out at a small constant (16 is customary)".

use std::io::{IoSlice, IoSliceMut};

/// Maximum number of discrete buffers a single `read_some`/`write_some`
/// call will hand to the OS in one syscall. Extra buffers beyond this are
/// still read/written, just over more than one internal `copy_to` pass is
/// never required since callers are expected to pass at most this many.
pub const MAX_IOV: usize = 16;

/// A read-only scatter/gather view used by `write_some`.
pub struct IoView<'a> {
    slices: &'a [IoSlice<'a>],
}

impl<'a> IoView<'a> {
    pub fn new(slices: &'a [IoSlice<'a>]) -> IoView<'a> {
        IoView { slices }
    }

    pub fn single(buf: &'a [u8]) -> (IoSlice<'a>,) {
        (IoSlice::new(buf),)
    }

    /// Copies up to [`MAX_IOV`] `IoSlice`s into `out`, returning how many
    /// were written. Buffers beyond the cap are silently not represented in
    /// this pass; callers that need more must issue another `write_some`.
    pub fn copy_to<'b>(&self, out: &'b mut [IoSlice<'a>; MAX_IOV]) -> usize
    where
        'a: 'b,
    {
        let n = self.slices.len().min(MAX_IOV);
        out[..n].clone_from_slice(&self.slices[..n]);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.slices.iter().all(|s| s.is_empty())
    }

    pub fn total_len(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }
}

/// A mutable scatter/gather view used by `read_some`.
pub struct IoViewMut<'a> {
    slices: &'a mut [IoSliceMut<'a>],
}

impl<'a> IoViewMut<'a> {
    pub fn new(slices: &'a mut [IoSliceMut<'a>]) -> IoViewMut<'a> {
        IoViewMut { slices }
    }

    pub fn is_empty(&self) -> bool {
        self.slices.iter().all(|s| s.is_empty())
    }

    pub fn total_len(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    pub fn slices_mut(&mut self) -> &mut [IoSliceMut<'a>] {
        self.slices
    }
}
