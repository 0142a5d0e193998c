//! OS-level thread identifiers, matching the ids listed by the `threads` profile.

/// Return the OS thread ID (TID) of the calling thread.
///
/// Linux uses `gettid`, macOS the Mach thread port. Other platforms report 0.
#[inline]
pub fn current_tid() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            unsafe { libc::syscall(libc::SYS_gettid) as u64 }
        } else if #[cfg(target_os = "macos")] {
            unsafe { libc::pthread_mach_thread_np(libc::pthread_self()) as u64 }
        } else {
            0
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn tids_differ_across_threads() {
        let main = current_tid();
        let other = std::thread::spawn(current_tid).join().unwrap();
        assert_ne!(main, 0);
        assert_ne!(main, other);
    }
}
