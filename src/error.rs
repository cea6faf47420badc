//! Error taxonomy of the allocator.
//!
//! Running out of memory is expected and callers handle it. Everything under
//! [`Corruption`] means our own metadata is broken and must never be swallowed.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("out of memory: the region primitive could not map {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("heap used before init()")]
    Uninitialized,

    /// An earlier call found corrupted metadata. Only [`crate::Heap::init`] recovers.
    #[error("heap poisoned by earlier corruption, call init() to reset")]
    Poisoned,

    #[error("heap corruption: {0}")]
    Corrupted(#[from] Corruption),
}

/// Unrecoverable invariant violations. Every variant carries the offending
/// address and, where one is known, the bounds of the region it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Corruption {
    #[error("address {address:#x} does not belong to any live region")]
    UnknownAddress { address: usize },

    #[error("bad boundary tag at {address:#x} in region {start:#x}..{end:#x}")]
    BadTag {
        address: usize,
        start: usize,
        end: usize,
    },

    #[error("block at {address:#x} of size {size} leaves region {start:#x}..{end:#x}")]
    Overrun {
        address: usize,
        size: usize,
        start: usize,
        end: usize,
    },

    #[error("header/footer mismatch for block at {address:#x}: header says {header}, footer says {footer}")]
    TagMismatch {
        address: usize,
        header: usize,
        footer: usize,
    },

    #[error("free blocks at {first:#x} and {second:#x} are adjacent but were not coalesced")]
    AdjacentFree { first: usize, second: usize },

    #[error("free list out of sync: {found} entries linked, {expected} free blocks in regions")]
    FreeListMismatch { expected: usize, found: usize },
}

pub type Result<T> = std::result::Result<T, HeapError>;
