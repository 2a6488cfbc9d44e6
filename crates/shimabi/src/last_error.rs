//! FFI-layer last-error string, independent of the per-connection tracked error in
//! `shimengine::error` — grounded in `qail-ffi`'s `LAST_ERROR` thread-local plus
//! `qail_last_error()`/`qail_free()` pair, used here for failures that happen before a
//! connection handle even exists (a malformed UTF-8 path, a null pointer argument).

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
    static ERROR_CSTRING: RefCell<Option<CString>> = const { RefCell::new(None) };
}

pub fn set_last_error(message: impl Into<String>) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(message.into()));
}

pub fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Return the last FFI-layer error for the calling thread, or NULL if there isn't one. The
/// returned pointer is owned by a thread-local cache and stays valid until the next call to
/// this function on the same thread; callers must not free it.
#[no_mangle]
pub extern "C" fn qshim_last_error() -> *const c_char {
    let message = LAST_ERROR.with(|e| e.borrow().clone());
    match message {
        Some(msg) => {
            let c_string = CString::new(msg).unwrap_or_else(|_| CString::new("error message contained a NUL byte").unwrap());
            let ptr = c_string.as_ptr();
            ERROR_CSTRING.with(|cache| *cache.borrow_mut() = Some(c_string));
            ptr
        }
        None => std::ptr::null(),
    }
}

/// Free a string this crate allocated and returned by value (as opposed to `qshim_last_error`,
/// whose pointer is borrowed from a thread-local cache and must never be passed here).
///
/// # Safety
/// `ptr` must be a pointer this crate returned from `CString::into_raw`, or null.
#[no_mangle]
pub unsafe extern "C" fn qshim_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// Borrow `ptr` as a `&str`, recording and returning an FFI-layer error on null or invalid
/// UTF-8 instead of panicking.
pub fn borrow_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, ()> {
    if ptr.is_null() {
        set_last_error(format!("{what} was NULL"));
        return Err(());
    }
    match unsafe { CStr::from_ptr(ptr) }.to_str() {
        Ok(s) => Ok(s),
        Err(e) => {
            set_last_error(format!("{what} was not valid UTF-8: {e}"));
            Err(())
        }
    }
}
