//! Platform-specific process setup.
//!
//! On Linux the VM child is tied to the harness with a parent-death signal so
//! a harness killed from outside never leaves QEMU running. Elsewhere there
//! is no equivalent and the hook does nothing.

use std::io;
use std::process::Command;

#[cfg(target_os = "linux")]
mod linux;

/// Arranges for the spawned child to die together with the harness.
#[cfg(target_os = "linux")]
pub fn bind_child_lifetime(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    let parent_pid = std::process::id() as i32;
    unsafe {
        cmd.pre_exec(move || linux::setup_parent_death_signal(parent_pid));
    }
}

#[cfg(not(target_os = "linux"))]
pub fn bind_child_lifetime(_cmd: &mut Command) {}

/// Sends `SIGTERM` to the given process.
pub fn request_stop(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
}
