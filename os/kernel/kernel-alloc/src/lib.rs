//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The two memory authorities of the kernel:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            Virtual Memory Manager (VMM)             │
//! │    • Region trees per address space                 │
//! │    • Placement, mapping and release of regions      │
//! │    • Memory space creation, copy and teardown       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ frames              │ page tables
//! ┌─────────────────▼──────────────┐  ┌───▼────────────────┐
//! │  Physical Memory Manager       │  │  kernel-vmem       │
//! │  • Buddy-class bitmaps         │  │  PagingSpace       │
//! │  • Constraints and boundaries  │  │                    │
//! └────────────────────────────────┘  └────────────────────┘
//! ```
//!
//! - [`pmm`]: contiguous physical ranges; also the `FrameAlloc` for page tables.
//! - [`region_tree`]: the per-space AVL tree of [`region::MemoryRegion`]s.
//! - [`vmm`]: [`vmm::VirtualMemoryManager`] and [`memory_space::MemorySpace`].
//! - [`phys_mapper`]: reaching physical frames through the direct map.
//!
//! Instances are constructed explicitly and passed by reference; the kernel
//! binary owns the long-lived ones.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod memory_space;
pub mod phys_mapper;
pub mod pmm;
pub mod region;
pub mod region_tree;
pub mod vmm;

pub use memory_space::MemorySpace;
pub use pmm::{PhysicalMemoryManager, PmmError, PmmStats};
pub use region::{MemoryRegion, Region};
pub use vmm::{AllocationTarget, VirtualMemoryManager, VmmError, VmmStats};
