//! Hardware-in-the-loop keyboard input check.
//!
//! Boots an OS image under QEMU, waits for the guest to reach its idle loop,
//! injects one key through QMP and passes once the guest's keyboard driver
//! reports the scancode on its serial console.

pub mod config;
pub mod console;
pub mod error;
pub mod framing;
pub mod harness;
pub mod milestone;
pub mod platform;
pub mod qmp;
pub mod supervisor;
pub mod util;

pub use config::{HarnessConfig, QemuOptions, prepare_launch};
pub use error::{FailureKind, HarnessError, TestOutcome};
pub use harness::Harness;
pub use supervisor::VmCommand;
pub use util::RetryPolicy;
