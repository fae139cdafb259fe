//! # Typed i386 Registers
//!
//! Bitfield models of the control registers, `EFLAGS` and the few MSRs the
//! kernel touches. Every model is plain data and can be built and inspected on
//! any host; the `asm` feature adds load/store implementations that only exist
//! when compiling for `x86`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "eflags")]
pub mod eflags;

#[cfg(feature = "msr")]
pub mod msr;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// Reads a register that is accessible from any privilege level.
    fn load() -> Self;
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}
