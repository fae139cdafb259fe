//! Portable pieces of application processor bring-up.
//!
//! The real-mode trampoline is copied below 1 MiB and its variables are
//! patched by offset through a [`TrampolineImage`]. Once in protected mode
//! every AP checks in with [`BootSync`] and spins until the BSP releases all
//! of them together.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TrampolineError {
    #[error("patch of {len} bytes at offset {offset:#x} leaves the trampoline")]
    PatchOutOfBounds { offset: usize, len: usize },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SmpError {
    #[error("only {arrived} of {expected} application processors checked in")]
    Timeout { expected: u32, arrived: u32 },
    #[error(transparent)]
    Trampoline(#[from] TrampolineError),
}

/// Check-in counter and release flag shared by the BSP and the APs.
#[derive(Debug, Default)]
pub struct BootSync {
    checked_in: AtomicU32,
    release: AtomicBool,
}

impl BootSync {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            checked_in: AtomicU32::new(0),
            release: AtomicBool::new(false),
        }
    }

    /// Called once by every AP. Returns its core index; the BSP is core 0.
    pub fn check_in(&self) -> usize {
        self.checked_in.fetch_add(1, Ordering::AcqRel) as usize + 1
    }

    #[must_use]
    pub fn checked_in(&self) -> u32 {
        self.checked_in.load(Ordering::Acquire)
    }

    /// Polls until `expected` APs checked in, for at most `spin_budget`
    /// rounds.
    ///
    /// # Errors
    /// [`SmpError::Timeout`] with the number that did arrive.
    pub fn wait_for(&self, expected: u32, spin_budget: u64) -> Result<(), SmpError> {
        for _ in 0..spin_budget {
            if self.checked_in() >= expected {
                return Ok(());
            }
            spin_loop();
        }
        let arrived = self.checked_in();
        if arrived >= expected {
            Ok(())
        } else {
            Err(SmpError::Timeout { expected, arrived })
        }
    }

    pub fn release(&self) {
        self.release.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.release.load(Ordering::Acquire)
    }

    /// AP side: spin until [`release`](Self::release).
    pub fn wait_for_release(&self) {
        while !self.is_released() {
            spin_loop();
        }
    }
}

/// The copied trampoline, patched in place (little endian).
pub struct TrampolineImage<'a> {
    bytes: &'a mut [u8],
}

impl<'a> TrampolineImage<'a> {
    pub const fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Copies `code` to the start of `target` and wraps the result.
    ///
    /// # Errors
    /// If `code` does not fit.
    pub fn install(target: &'a mut [u8], code: &[u8]) -> Result<Self, TrampolineError> {
        let mut image = Self::new(target);
        image.patch_bytes(0, code)?;
        Ok(image)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn window(&mut self, offset: usize, len: usize) -> Result<&mut [u8], TrampolineError> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get_mut(offset..end))
            .ok_or(TrampolineError::PatchOutOfBounds { offset, len })
    }

    /// # Errors
    /// If the patch does not fit.
    pub fn patch_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), TrampolineError> {
        self.window(offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// # Errors
    /// If the patch does not fit.
    pub fn patch_u16(&mut self, offset: usize, value: u16) -> Result<(), TrampolineError> {
        self.patch_bytes(offset, &value.to_le_bytes())
    }

    /// # Errors
    /// If the patch does not fit.
    pub fn patch_u32(&mut self, offset: usize, value: u32) -> Result<(), TrampolineError> {
        self.patch_bytes(offset, &value.to_le_bytes())
    }

    /// # Errors
    /// If the read leaves the image.
    pub fn read_u32(&mut self, offset: usize) -> Result<u32, TrampolineError> {
        let window = self.window(offset, 4)?;
        Ok(u32::from_le_bytes([window[0], window[1], window[2], window[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn patches_land_little_endian() {
        let mut page = [0u8; 64];
        let mut image = TrampolineImage::install(&mut page, &[0xFA, 0xFC]).unwrap();
        image.patch_u32(8, 0x1234_5678).unwrap();
        image.patch_u16(12, 0xBEEF).unwrap();
        assert_eq!(image.read_u32(8).unwrap(), 0x1234_5678);
        assert_eq!(&page[..2], &[0xFA, 0xFC]);
        assert_eq!(&page[8..14], &[0x78, 0x56, 0x34, 0x12, 0xEF, 0xBE]);
    }

    #[test]
    fn out_of_bounds_patches_are_rejected() {
        let mut page = [0u8; 16];
        let mut image = TrampolineImage::new(&mut page);
        assert_eq!(
            image.patch_u32(14, 1),
            Err(TrampolineError::PatchOutOfBounds { offset: 14, len: 4 })
        );
        assert!(image.patch_u16(usize::MAX, 1).is_err());
        let err: SmpError = TrampolineImage::install(&mut [0u8; 2], &[0; 3]).err().unwrap().into();
        assert_eq!(
            err.to_string(),
            "patch of 3 bytes at offset 0x0 leaves the trampoline"
        );
        assert_eq!(page, [0; 16]);
    }

    #[test]
    fn aps_check_in_and_wait_for_release() {
        let sync = Arc::new(BootSync::new());
        let aps: Vec<_> = (0..3)
            .map(|_| {
                let sync = sync.clone();
                std::thread::spawn(move || {
                    let index = sync.check_in();
                    sync.wait_for_release();
                    index
                })
            })
            .collect();

        sync.wait_for(3, u64::MAX).unwrap();
        sync.release();
        let mut indices: Vec<_> = aps.into_iter().map(|h| h.join().unwrap()).collect();
        indices.sort_unstable();
        assert_eq!(indices, [1, 2, 3]);
    }

    #[test]
    fn missing_aps_time_out() {
        let sync = BootSync::new();
        sync.check_in();
        assert_eq!(
            sync.wait_for(2, 1000),
            Err(SmpError::Timeout {
                expected: 2,
                arrived: 1
            })
        );
        assert!(!sync.is_released());
    }
}
