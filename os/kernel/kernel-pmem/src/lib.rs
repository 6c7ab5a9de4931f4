//! # Physical Memory Management
//!
//! This crate owns physical memory from the moment the boot code knows how
//! much of it exists:
//!
//! 1. [`boot::BootAlloc`] hands out physical memory linearly while the frame
//!    database does not exist yet. It never frees and is consumed by the
//!    address-space constructor, so nothing can reach for it afterwards.
//! 2. [`kspace::build_kernel_space`] builds the kernel's own two-level
//!    address space: the physical-memory window, the self-referential table
//!    mappings, the kernel stack, and the user-read-only metadata windows.
//!    As its last act it carves the frame-metadata array and hands the
//!    remaining memory to the frame database.
//! 3. [`frames::FrameDb`] is the steady-state owner of every physical frame:
//!    reference counts, the free list, and the allocation seams the mapping
//!    operations in `kernel-vmem` charge references through.
//!
//! ## Concurrency
//!
//! All state here is `&mut`-threaded; the embedding kernel wraps the frame
//! database in its lock of choice before going multi-threaded.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot;
pub mod frames;
pub mod kspace;
pub mod phys_mapper;

pub use boot::BootAlloc;
pub use frames::{FrameDb, FrameDbError, FrameInfo};
pub use kspace::{KernelSpace, PhysExtent, build_kernel_space};
pub use phys_mapper::KernelBaseMapper;
