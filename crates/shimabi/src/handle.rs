//! Opaque host-visible handles.
//!
//! The host never dereferences the `sqlite3*`/`sqlite3_stmt*` pointers this crate hands back —
//! it only carries them as identifiers into later calls (spec.md glossary: "Host handle").
//! Minting a real (if otherwise unused) heap allocation per handle, rather than a bare integer
//! cast to a pointer, keeps every returned pointer a genuinely valid, uniquely-addressed
//! allocation for the lifetime of the object it names, and gives `close`/`finalize` something
//! concrete to free.

use shimcore::types::HostHandle;

pub fn mint() -> HostHandle {
    let raw = Box::into_raw(Box::new(0u8));
    HostHandle(raw as usize)
}

/// # Safety
/// `handle` must have come from `mint()` and not have been released already.
pub unsafe fn release(handle: HostHandle) {
    drop(Box::from_raw(handle.0 as *mut u8));
}

pub fn from_ptr<T>(ptr: *mut T) -> HostHandle {
    HostHandle(ptr as usize)
}

pub fn to_ptr<T>(handle: HostHandle) -> *mut T {
    handle.0 as *mut T
}
