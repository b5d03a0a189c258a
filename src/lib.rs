//! A multithreaded general-purpose memory allocator written in Rust.
//!
//! The design follows the classic boundary-tag / segregated-bin school of
//! allocator construction: freed memory is kept in 64 size-classed free
//! lists, a bitmap makes "find me a chunk at least this big" a couple of bit
//! operations, and adjacent free chunks are merged eagerly so the heap does
//! not decay into unusable slivers.
//!
//! # Usage
//! To use this crate add `binmalloc` as a dependency in your project's
//! `Cargo.toml`.
//! ```toml
//! [dependencies]
//! binmalloc = "0.1"
//! ```
//!
//! ```
//! use binmalloc::{BinMalloc, SysVm};
//!
//! #[global_allocator]
//! static ALLOCATOR: BinMalloc<SysVm> = unsafe { BinMalloc::with_vm(SysVm::new()) };
//!
//! fn main() {
//!     let v1: Vec<u32> = vec![1, 2, 3];
//!     println!("Bins are cool {:?}", v1);
//! }
//! ```
//!
//! # Mode of operation
//! Below is a list of the abstractions the allocator uses to operate on the
//! heap:
//!
//! ## Chunks
//! The heap is divided into chunks. Each chunk starts with a two-word
//! header: the size of the chunk before it and its own size, each with the
//! low bit doubling as an in-use flag. Because a chunk's size is mirrored
//! into the header of the chunk after it, both neighbors of any chunk can be
//! found in constant time, which is what makes eager merging cheap. The
//! user-visible allocation starts right after the header.
//!
//! ## Bins
//! A free chunk sits in one of 64 doubly-linked lists, segregated by size:
//! exact size classes for small chunks, geometrically spaced ranges above
//! that, and a final catch-all. A 64-bit occupancy bitmap has one bit per
//! bin, so finding the smallest non-empty bin that can satisfy a request is
//! a mask and a count-trailing-zeros. Each bin has its own lock; threads
//! allocating from different size classes never contend.
//!
//! ## Growth
//! When no binned chunk fits, the heap grows: preferably by advancing the
//! program break (keeping the heap contiguous), or by mapping a fresh
//! anonymous region when the break cannot move. Requests above a fixed
//! threshold (224 KiB worth of chunk) skip the bins entirely and get their
//! own mapping, returned to the system the moment they are freed.
//!
//! ## Sources
//! All system memory flows through the [`VmSource`] trait. [`SysVm`] is the
//! real thing (`brk`, `mmap` and friends); the test suite drives the same
//! engine over a plain in-process buffer instead, which keeps the algorithm
//! testable without stubbing syscalls.
//!
//! ## Hardening
//! The header mirroring doubles as a corruption check: freeing a chunk whose
//! neighbor disagrees about its size aborts the process rather than letting
//! the free lists be poisoned. Double frees of mapped chunks are caught the
//! same way.
//!
//! [`VmSource`]: vm::VmSource

pub use crate::malloc::BinMalloc;
pub use crate::vm::SysVm;

mod bins;
mod chunk;
mod heap;
mod lock;
pub mod malloc;
pub mod vm;
