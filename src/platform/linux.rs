//! Linux-specific process setup.

use std::io;

/// Makes the calling (child) process receive `SIGKILL` when its parent dies.
///
/// # Safety
///
/// Must only be called between `fork` and `exec`, where nothing but
/// async-signal-safe functions may run.
pub unsafe fn setup_parent_death_signal(parent_pid: i32) -> io::Result<()> {
    unsafe {
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
            return Err(io::Error::last_os_error());
        }
        // The parent may already be gone by the time prctl ran.
        if libc::getppid() != parent_pid {
            return Err(io::Error::other("parent exited before exec"));
        }
    }
    Ok(())
}
