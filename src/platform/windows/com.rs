use std::ffi::c_void;
use std::marker::PhantomData;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use anyhow::{Context, Result};
use windows::core::Interface;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED};

pub(crate) struct CoInitGuard {
    should_uninit: bool,
}

impl CoInitGuard {
    pub fn init_multithreaded() -> Result<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            return Ok(Self {
                should_uninit: false,
            });
        }

        hr.ok()
            .context("failed to initialize COM with CoInitializeEx(COINIT_MULTITHREADED)")?;
        Ok(Self {
            should_uninit: true,
        })
    }
}

impl Drop for CoInitGuard {
    fn drop(&mut self) {
        if self.should_uninit {
            unsafe {
                CoUninitialize();
            }
        }
    }
}

/// A single-machine-word slot owning at most one COM interface.
///
/// `store` and `take` are full ownership transfers implemented with one
/// atomic pointer swap each, so a stored interface is released exactly
/// once no matter how the calls interleave. There is deliberately no
/// borrowing accessor: handing out a raw pointer while another thread
/// can swap it away is exactly the double-release hazard this type
/// exists to rule out. Readers that need the value take it, use it, and
/// store it back.
pub(crate) struct InterfaceSlot<I: Interface> {
    ptr: AtomicPtr<c_void>,
    _marker: PhantomData<I>,
}

unsafe impl<I: Interface> Send for InterfaceSlot<I> {}
unsafe impl<I: Interface> Sync for InterfaceSlot<I> {}

impl<I: Interface> InterfaceSlot<I> {
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(null_mut()),
            _marker: PhantomData,
        }
    }

    /// Puts `value` into the slot, releasing whatever was there.
    pub fn store(&self, value: Option<I>) {
        let raw = value.map_or(null_mut(), |v| v.into_raw());
        let old = self.ptr.swap(raw, Ordering::SeqCst);
        if !old.is_null() {
            // SAFETY: `old` came from `into_raw` in a previous `store`,
            // and the swap above is the only way it leaves the slot.
            drop(unsafe { I::from_raw(old) });
        }
    }

    /// Removes and returns the held interface, leaving the slot empty.
    pub fn take(&self) -> Option<I> {
        let raw = self.ptr.swap(null_mut(), Ordering::SeqCst);
        if raw.is_null() {
            None
        } else {
            // SAFETY: same provenance argument as in `store`.
            Some(unsafe { I::from_raw(raw) })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.load(Ordering::SeqCst).is_null()
    }
}

impl<I: Interface> Drop for InterfaceSlot<I> {
    fn drop(&mut self) {
        self.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use windows::core::{IUnknown, GUID, HRESULT};

    // A minimal hand-rolled COM object so refcount conservation can be
    // observed directly.
    #[repr(C)]
    struct TestVtbl {
        query_interface:
            unsafe extern "system" fn(*mut c_void, *const GUID, *mut *mut c_void) -> HRESULT,
        add_ref: unsafe extern "system" fn(*mut c_void) -> u32,
        release: unsafe extern "system" fn(*mut c_void) -> u32,
    }

    #[repr(C)]
    struct TestObject {
        vtbl: *const TestVtbl,
        refs: AtomicU32,
    }

    unsafe extern "system" fn test_query_interface(
        this: *mut c_void,
        _riid: *const GUID,
        out: *mut *mut c_void,
    ) -> HRESULT {
        // Good enough for IUnknown-only tests: always hand back `this`.
        unsafe {
            test_add_ref(this);
            *out = this;
        }
        HRESULT(0)
    }

    unsafe extern "system" fn test_add_ref(this: *mut c_void) -> u32 {
        let object = this as *mut TestObject;
        unsafe { (*object).refs.fetch_add(1, Ordering::SeqCst) + 1 }
    }

    unsafe extern "system" fn test_release(this: *mut c_void) -> u32 {
        let object = this as *mut TestObject;
        unsafe { (*object).refs.fetch_sub(1, Ordering::SeqCst) - 1 }
    }

    static TEST_VTBL: TestVtbl = TestVtbl {
        query_interface: test_query_interface,
        add_ref: test_add_ref,
        release: test_release,
    };

    fn make_object() -> (Box<TestObject>, IUnknown) {
        let object = Box::new(TestObject {
            vtbl: &TEST_VTBL,
            refs: AtomicU32::new(1),
        });
        let raw = &*object as *const TestObject as *mut c_void;
        let unknown = unsafe { IUnknown::from_raw(raw) };
        (object, unknown)
    }

    fn refs(object: &TestObject) -> u32 {
        object.refs.load(Ordering::SeqCst)
    }

    #[test]
    fn store_take_drop_conserves_the_refcount() {
        let (object, unknown) = make_object();
        assert_eq!(refs(&object), 1);

        let slot = InterfaceSlot::<IUnknown>::new();
        slot.store(Some(unknown.clone()));
        assert_eq!(refs(&object), 2);

        // Overwriting releases the previous occupant.
        slot.store(Some(unknown.clone()));
        assert_eq!(refs(&object), 2);

        let taken = slot.take().expect("slot had a value");
        assert!(slot.is_empty());
        assert_eq!(refs(&object), 2);

        drop(taken);
        assert_eq!(refs(&object), 1);

        slot.store(Some(unknown));
        assert_eq!(refs(&object), 1);
        drop(slot); // slot drop releases its occupant
        assert_eq!(refs(&object), 0);
    }

    #[test]
    fn clearing_an_empty_slot_is_a_no_op() {
        let slot = InterfaceSlot::<IUnknown>::new();
        slot.store(None);
        assert!(slot.is_empty());
        assert!(slot.take().is_none());
    }

    #[test]
    fn cloning_and_dropping_handles_balances_out() {
        let (object, unknown) = make_object();
        let cloned = unknown.clone();
        assert_eq!(refs(&object), 2);
        drop(cloned);
        drop(unknown);
        assert_eq!(refs(&object), 0);
    }
}
