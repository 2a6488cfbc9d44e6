//! Remaining-stack measurement (spec.md §4.2 prepare step 3: "measure remaining stack room
//! via the platform thread-attribute API").
//!
//! On Linux/glibc, `pthread_getattr_np` plus `pthread_attr_getstack` report the calling
//! thread's stack base and size; remaining room is the distance from a stack-local address to
//! the low end of that range (stacks grow down on every platform this shim targets).

#[cfg(target_os = "linux")]
pub fn remaining_stack_bytes() -> usize {
    use std::mem::MaybeUninit;

    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return usize::MAX;
        }
        let mut base = MaybeUninit::<*mut libc::c_void>::uninit();
        let mut size = MaybeUninit::<libc::size_t>::uninit();
        let rc = libc::pthread_attr_getstack(&attr, base.as_mut_ptr(), size.as_mut_ptr());
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return usize::MAX;
        }
        let base = base.assume_init() as usize;
        let size = size.assume_init();
        let low_bound = base;
        let marker: u8 = 0;
        let current = &marker as *const u8 as usize;
        current.saturating_sub(low_bound).min(size)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn remaining_stack_bytes() -> usize {
    // No portable equivalent wired up for other platforms; treat as "plenty of room" rather
    // than spuriously tripping the delegation/abort thresholds.
    usize::MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_a_plausible_value() {
        let remaining = remaining_stack_bytes();
        assert!(remaining > 0);
    }
}
