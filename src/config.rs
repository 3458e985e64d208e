//! Harness configuration and QEMU launch preparation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarnessError;
use crate::milestone::Markers;
use crate::supervisor::VmCommand;
use crate::util::RetryPolicy;

pub const DEFAULT_IDLE_MARKER: &str = "cool-os: entering idle loop";
pub const DEFAULT_CONFIRM_MARKER: &str = "KBD: Scancode:";

/// Firmware search list used when no override directory is given or the
/// override does not contain the firmware.
pub const FIRMWARE_SEARCH_DIRS: &[&str] = &[
    "/usr/share/edk2/x64",
    "/usr/share/edk2-ovmf/x64",
    "/usr/share/OVMF",
    "/usr/share/qemu",
];

const FIRMWARE_NAMES: &[(&str, &str)] = &[
    ("OVMF_CODE.4m.fd", "OVMF_VARS.4m.fd"),
    ("OVMF_CODE.fd", "OVMF_VARS.fd"),
];

/// Per-run settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// QMP socket created by the VM.
    pub control_socket: PathBuf,
    /// Wall-clock budget for boot, handshake and confirmation.
    pub deadline: Duration,
    pub poll_interval: Duration,
    /// Bound on one control-channel request/response.
    pub round_trip_timeout: Duration,
    pub connect_retry: RetryPolicy,
    /// How long the VM gets to exit after SIGTERM before it is killed.
    pub teardown_grace: Duration,
    pub idle_marker: String,
    pub confirm_marker: String,
    /// QKeyCode injected once the guest idles.
    pub key: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from("qmp.sock"),
            deadline: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            round_trip_timeout: Duration::from_secs(5),
            connect_retry: RetryPolicy::default(),
            teardown_grace: Duration::from_secs(2),
            idle_marker: DEFAULT_IDLE_MARKER.to_string(),
            confirm_marker: DEFAULT_CONFIRM_MARKER.to_string(),
            key: "a".to_string(),
        }
    }
}

impl HarnessConfig {
    pub fn markers(&self) -> Markers {
        Markers {
            idle: self.idle_marker.clone(),
            confirm: self.confirm_marker.clone(),
        }
    }
}

/// UEFI code image plus the template for its writable variable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePair {
    pub code: PathBuf,
    pub vars: PathBuf,
}

/// Finds the firmware pair, trying `override_dir` before `search_dirs`.
pub fn locate_firmware<P: AsRef<Path>>(
    override_dir: Option<&Path>,
    search_dirs: &[P],
) -> Result<FirmwarePair, HarnessError> {
    let dirs = override_dir
        .into_iter()
        .chain(search_dirs.iter().map(|d| d.as_ref()));
    for dir in dirs {
        for (code, vars) in FIRMWARE_NAMES {
            let pair = FirmwarePair {
                code: dir.join(code),
                vars: dir.join(vars),
            };
            if pair.code.is_file() && pair.vars.is_file() {
                tracing::debug!(code = %pair.code.display(), "found firmware");
                return Ok(pair);
            }
        }
    }
    Err(HarnessError::Precondition(format!(
        "OVMF firmware not found in {}{}",
        override_dir
            .map(|d| format!("{}, ", d.display()))
            .unwrap_or_default(),
        search_dirs
            .iter()
            .map(|d| d.as_ref().display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Inputs for building the QEMU command line.
#[derive(Debug, Clone)]
pub struct QemuOptions {
    pub qemu: PathBuf,
    pub image: PathBuf,
    pub build_dir: PathBuf,
    pub firmware_dir: Option<PathBuf>,
    pub firmware_search_dirs: Vec<PathBuf>,
    pub memory: String,
    pub kvm: bool,
    /// Keep the legacy i8042 PS/2 controller instead of USB-only input.
    pub ps2: bool,
}

impl Default for QemuOptions {
    fn default() -> Self {
        Self {
            qemu: PathBuf::from("qemu-system-x86_64"),
            image: PathBuf::from("build/dist/cool-os-debug.img"),
            build_dir: PathBuf::from("build"),
            firmware_dir: None,
            firmware_search_dirs: FIRMWARE_SEARCH_DIRS.iter().map(PathBuf::from).collect(),
            memory: "256M".to_string(),
            kvm: true,
            ps2: false,
        }
    }
}

/// Checks the artifacts and builds the VM command. Nothing is launched and
/// no socket is created; a failure here is a precondition error.
pub fn prepare_launch(
    options: &QemuOptions,
    control_socket: &Path,
) -> Result<VmCommand, HarnessError> {
    if !options.image.is_file() {
        return Err(HarnessError::Precondition(format!(
            "disk image {} not found",
            options.image.display()
        )));
    }
    let firmware = locate_firmware(options.firmware_dir.as_deref(), &options.firmware_search_dirs)?;
    let vars = ensure_vars_store(&firmware, &options.build_dir)?;
    Ok(qemu_command(options, &firmware.code, &vars, control_socket))
}

/// Copies the variable store template into the build directory once; later
/// runs reuse the copy.
fn ensure_vars_store(firmware: &FirmwarePair, build_dir: &Path) -> Result<PathBuf, HarnessError> {
    let file_name = firmware
        .vars
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("OVMF_VARS.fd"));
    let target = build_dir.join(file_name);
    if target.exists() {
        return Ok(target);
    }
    std::fs::create_dir_all(build_dir)
        .and_then(|_| std::fs::copy(&firmware.vars, &target))
        .map_err(|e| {
            HarnessError::Precondition(format!(
                "cannot copy {} to {}: {}",
                firmware.vars.display(),
                target.display(),
                e
            ))
        })?;
    tracing::debug!(vars = %target.display(), "created writable firmware variable store");
    Ok(target)
}

fn qemu_command(options: &QemuOptions, code: &Path, vars: &Path, control_socket: &Path) -> VmCommand {
    let mut args: Vec<OsString> = Vec::new();
    if options.kvm {
        args.extend(["-enable-kvm", "-cpu", "host"].map(OsString::from));
    }
    args.extend(["-m", options.memory.as_str(), "-no-reboot", "-no-shutdown"].map(OsString::from));
    args.push("-drive".into());
    args.push(drive("if=pflash,format=raw,readonly=on,file=", code));
    args.push("-drive".into());
    args.push(drive("if=pflash,format=raw,file=", vars));
    args.push("-drive".into());
    args.push(drive("format=raw,file=", &options.image));
    args.extend(["-device", "qemu-xhci", "-device", "usb-kbd"].map(OsString::from));
    args.push("-qmp".into());
    let mut qmp = OsString::from("unix:");
    qmp.push(control_socket);
    qmp.push(",server,nowait");
    args.push(qmp);
    args.extend(["-serial", "stdio", "-display", "none"].map(OsString::from));
    let machine = if options.ps2 { "pc" } else { "pc,i8042=off" };
    args.push("-machine".into());
    args.push(machine.into());

    VmCommand::new(&options.qemu).args(args)
}

fn drive(prefix: &str, path: &Path) -> OsString {
    let mut value = OsString::from(prefix);
    value.push(path);
    value
}
