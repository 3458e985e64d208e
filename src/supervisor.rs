//! VM process lifecycle.
//!
//! [`launch`] owns the only handle to the child. Teardown is idempotent and
//! also runs from `Drop`, so every exit path of the harness releases the
//! process and the control-socket file.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::console::ConsoleMonitor;
use crate::error::HarnessError;
use crate::platform;

/// Command line used to start the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl VmCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// The running VM.
pub struct VmProcess {
    child: Child,
    console: ConsoleMonitor,
    control_socket: PathBuf,
    exit_status: Option<ExitStatus>,
    grace: Duration,
    torn_down: bool,
}

/// Starts the VM with stdout and stderr captured and stdin detached.
///
/// A stale control socket at `control_socket` is removed first.
pub fn launch(
    command: &VmCommand,
    control_socket: &Path,
    grace: Duration,
) -> Result<VmProcess, HarnessError> {
    remove_socket_file(control_socket);

    let program = command.program.to_string_lossy().into_owned();
    let mut cmd = command.to_command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    platform::bind_child_lifetime(&mut cmd);

    let mut child = cmd.spawn().map_err(|source| HarnessError::Launch {
        program: program.clone(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .map(|s| Box::new(s) as Box<dyn Read + Send>);
    let stderr = child
        .stderr
        .take()
        .map(|s| Box::new(s) as Box<dyn Read + Send>);
    let console = match ConsoleMonitor::spawn(stdout.into_iter().chain(stderr)) {
        Ok(console) => console,
        Err(source) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HarnessError::Launch { program, source });
        }
    };

    tracing::info!(pid = child.id(), program = %program, "vm process started");
    Ok(VmProcess {
        child,
        console,
        control_socket: control_socket.to_path_buf(),
        exit_status: None,
        grace,
        torn_down: false,
    })
}

impl VmProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "vm process exited");
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to query vm process state");
                false
            }
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Next complete console line, if one is buffered.
    pub fn poll_line(&mut self) -> Option<String> {
        self.console.poll_line()
    }

    /// True once the console streams are exhausted.
    pub fn console_closed(&mut self) -> bool {
        self.console.is_closed()
    }

    /// Stops and reaps the VM, then removes the control socket. Safe to call
    /// repeatedly and after the process already exited.
    pub fn terminate(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if self.is_alive() {
            if let Err(e) = platform::request_stop(self.id()) {
                tracing::warn!(error = %e, "failed to signal vm process");
            }
            let deadline = Instant::now() + self.grace;
            while self.is_alive() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if self.is_alive() {
                tracing::warn!(grace = ?self.grace, "vm process ignored SIGTERM, killing");
                if let Err(e) = self.child.kill() {
                    tracing::warn!(error = %e, "failed to kill vm process");
                }
            }
        }

        match self.child.wait() {
            Ok(status) => {
                self.exit_status.get_or_insert(status);
                tracing::info!(%status, "vm process reaped");
            }
            Err(e) => tracing::warn!(error = %e, "failed to reap vm process"),
        }
        remove_socket_file(&self.control_socket);
    }
}

impl Drop for VmProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed control socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove control socket"),
    }
}
