//! Patching one virtual-method slot, and undoing it.
//!
//! DXGI hands every swap chain in a process the same vtable, so
//! replacing the `Present` entry once routes every present -- including
//! the compositor's -- through the replacement. Install and removal are
//! serialized by a mutex and publish with a single word-sized store;
//! the hooked call site reads the original address lock-free.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use windows::Win32::System::Memory::{VirtualProtect, PAGE_PROTECTION_FLAGS, PAGE_READWRITE};

pub(crate) struct VtableHook {
    /// Address of the patched vtable slot; 0 while not installed.
    slot: AtomicUsize,
    /// The displaced original function; what the replacement forwards to.
    original: AtomicUsize,
    guard: Mutex<()>,
}

/// Swaps the word at `slot` for `value`, temporarily lifting the page
/// protection (vtables live in read-only data). Returns the displaced
/// word.
unsafe fn swap_protected_word(slot: *mut usize, value: usize) -> Result<usize> {
    let mut previous_protection = PAGE_PROTECTION_FLAGS::default();
    unsafe {
        VirtualProtect(
            slot as *const _,
            std::mem::size_of::<usize>(),
            PAGE_READWRITE,
            &mut previous_protection,
        )
    }
    .context("VirtualProtect(PAGE_READWRITE) failed")?;

    // Word-aligned single store: readers racing with this see either
    // the old or the new function, never a torn pointer.
    let atomic_slot = unsafe { &*(slot as *const AtomicUsize) };
    let displaced = atomic_slot.swap(value, Ordering::SeqCst);

    let mut ignored = PAGE_PROTECTION_FLAGS::default();
    unsafe {
        VirtualProtect(
            slot as *const _,
            std::mem::size_of::<usize>(),
            previous_protection,
            &mut ignored,
        )
    }
    .context("VirtualProtect(restore) failed")?;

    Ok(displaced)
}

impl VtableHook {
    pub const fn new() -> Self {
        Self {
            slot: AtomicUsize::new(0),
            original: AtomicUsize::new(0),
            guard: Mutex::new(()),
        }
    }

    /// Redirects the vtable entry at `slot` to `replacement`.
    ///
    /// # Safety
    ///
    /// `slot` must point at a live vtable entry whose callees tolerate
    /// being swapped at runtime, and `replacement` must match the
    /// displaced function's ABI exactly.
    pub unsafe fn install(&self, slot: *mut usize, replacement: usize) -> Result<()> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        if self.slot.load(Ordering::SeqCst) != 0 {
            return Err(anyhow!("hook is already installed"));
        }

        let displaced = unsafe { swap_protected_word(slot, replacement) }?;
        self.original.store(displaced, Ordering::SeqCst);
        self.slot.store(slot as usize, Ordering::SeqCst);
        Ok(())
    }

    /// Restores the original vtable entry. Must succeed before the
    /// hooking module may be unloaded; a failure leaves the hook in
    /// place and the module pinned.
    pub unsafe fn remove(&self) -> Result<()> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let slot = self.slot.load(Ordering::SeqCst);
        if slot == 0 {
            return Ok(());
        }

        let original = self.original.load(Ordering::SeqCst);
        unsafe { swap_protected_word(slot as *mut usize, original) }?;
        self.slot.store(0, Ordering::SeqCst);
        self.original.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// The displaced function, for the replacement to forward to.
    /// Lock-free; safe to call from the hooked site itself.
    pub fn original(&self) -> usize {
        self.original.load(Ordering::SeqCst)
    }

    pub fn is_installed(&self) -> bool {
        self.slot.load(Ordering::SeqCst) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_swaps_and_remove_restores() {
        // A stand-in vtable slot on the heap; already writable, so the
        // protection round-trip is a no-op but still exercised.
        let mut slot_storage: usize = 0x1111;
        let slot = &mut slot_storage as *mut usize;

        let hook = VtableHook::new();
        unsafe { hook.install(slot, 0x2222) }.unwrap();
        assert!(hook.is_installed());
        assert_eq!(slot_storage, 0x2222);
        assert_eq!(hook.original(), 0x1111);

        unsafe { hook.remove() }.unwrap();
        assert!(!hook.is_installed());
        assert_eq!(slot_storage, 0x1111);
        assert_eq!(hook.original(), 0);
    }

    #[test]
    fn double_install_is_rejected() {
        let mut slot_storage: usize = 7;
        let slot = &mut slot_storage as *mut usize;

        let hook = VtableHook::new();
        unsafe { hook.install(slot, 8) }.unwrap();
        assert!(unsafe { hook.install(slot, 9) }.is_err());
        assert_eq!(slot_storage, 8);
        unsafe { hook.remove() }.unwrap();
    }

    #[test]
    fn remove_without_install_is_a_no_op() {
        let hook = VtableHook::new();
        assert!(unsafe { hook.remove() }.is_ok());
        assert!(!hook.is_installed());
    }
}
