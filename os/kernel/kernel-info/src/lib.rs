//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the boot handoff types shared by the kernel
//! binary, its build script and the memory management crates.
//!
//! ## Virtual Memory Architecture
//!
//! The kernel runs in the upper gigabyte of a 32-bit address space:
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Null guard / low identity      │
//! 0x0040_0000 ├─────────────────────────────────┤ USERSPACE_START
//!             │         User Space              │
//!             │   (per address space tree)      │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_BOUNDARY = KERNEL_BASE
//!             │   Direct map of low physical    │
//!             │   memory (4 MiB pages), with    │
//!             │   the kernel image at PHYS_LOAD │
//! 0xE000_0000 ├─────────────────────────────────┤ KERNEL_REGIONS_START
//!             │   Kernel regions (heap, stacks, │
//!             │   MMIO windows), shared tables  │
//! 0xFFC0_0000 ├─────────────────────────────────┤ RECURSIVE_TABLES_BASE
//!             │   Recursive page table window   │
//! 0xFFFF_F000 └─────────────────────────────────┘ RECURSIVE_DIRECTORY
//! ```
//!
//! ## Boot Protocol
//!
//! A multiboot (v1) compliant loader enters the kernel in protected mode with
//! paging disabled. The [`boot`] module decodes the information structure it
//! hands over, in particular the firmware memory map.
//!
//! ## Build Integration
//! ```rust
//! use kernel_info::memory::{KERNEL_BASE, PHYS_LOAD};
//!
//! println!("cargo:rustc-link-arg=--defsym=KERNEL_BASE={:#x}", KERNEL_BASE);
//! println!("cargo:rustc-link-arg=--defsym=PHYS_LOAD={:#x}", PHYS_LOAD);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
