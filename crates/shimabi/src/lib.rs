//! C ABI surface for the embedded-to-Postgres redirect shim (spec.md §6 "External
//! Interfaces").
//!
//! Every exported function is prefixed `qshim_` rather than reusing the embedded library's own
//! `sqlite3_*` names: this crate statically links the real embedded library (`libsqlite3-sys`,
//! bundled) for its shadow statements, so exporting literal `sqlite3_*` symbols from the same
//! binary would collide with the ones the bundled build already defines. Routing host calls to
//! these names instead (preload interposition, dynamic symbol rebinding, or linking against a
//! thin forwarding shim) is deployment-layer glue that spec.md §9 explicitly scopes out.

pub mod accessors;
pub mod connection;
pub mod handle;
pub mod last_error;
pub mod logging;
pub mod statement;

use std::os::raw::{c_char, c_void};

/// Opaque handle to a live database or statement, as seen through the ABI (re-exported for
/// downstream crates that embed this one directly rather than through its C symbols).
pub use shimcore::types::HostHandle;

/// Initialize the process-wide context and logging. Idempotent: the host may call this
/// explicitly, but `qshim_open` calls it too so a host that never heard of this function still
/// gets a working shim.
#[no_mangle]
pub extern "C" fn qshim_init() {
    let ctx = shimengine::init();
    logging::install(&ctx.config);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "shim initialized");
}

/// Allocate `size` bytes the host can later free with `qshim_free`. Mirrors the embedded
/// library's own `sqlite3_malloc`/`sqlite3_free` pair (spec.md §6 "malloc/free") so code that
/// already frees embedded-allocated buffers through this pair keeps working uniformly for
/// buffers this crate hands back too.
///
/// # Safety
/// `size` should be nonzero; a zero-size request returns NULL, matching the embedded library.
#[no_mangle]
pub unsafe extern "C" fn qshim_malloc(size: usize) -> *mut c_void {
    if size == 0 {
        return std::ptr::null_mut();
    }
    let layout = match std::alloc::Layout::array::<u8>(size) {
        Ok(l) => l,
        Err(_) => return std::ptr::null_mut(),
    };
    std::alloc::alloc(layout) as *mut c_void
}

/// # Safety
/// `ptr` must have been returned by `qshim_malloc` with the same `size`, or be NULL.
#[no_mangle]
pub unsafe extern "C" fn qshim_free(ptr: *mut c_void, size: usize) {
    if ptr.is_null() || size == 0 {
        return;
    }
    if let Ok(layout) = std::alloc::Layout::array::<u8>(size) {
        std::alloc::dealloc(ptr as *mut u8, layout);
    }
}

/// Library version string, supplementing the host-visible surface with something a deployment
/// can log or assert on (spec.md §6 is silent on introspection beyond the error accessors).
///
/// # Safety
/// The returned pointer is a freshly allocated `CString`; the caller owns it and must release
/// it with `qshim_free_string`.
#[no_mangle]
pub unsafe extern "C" fn shim_version() -> *mut c_char {
    std::ffi::CString::new(env!("CARGO_PKG_VERSION")).unwrap_or_default().into_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_then_free_round_trips_without_crashing() {
        unsafe {
            let ptr = qshim_malloc(16);
            assert!(!ptr.is_null());
            qshim_free(ptr, 16);
        }
    }

    #[test]
    fn malloc_zero_returns_null() {
        unsafe {
            assert!(qshim_malloc(0).is_null());
        }
    }
}
