use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kbdprobe::config::{DEFAULT_CONFIRM_MARKER, DEFAULT_IDLE_MARKER};
use kbdprobe::{Harness, HarnessConfig, QemuOptions, TestOutcome, prepare_launch};

#[derive(Debug, Parser)]
#[command(
    name = "kbdprobe",
    about = "Boot an OS image under QEMU and verify keyboard input end to end"
)]
struct Args {
    /// QEMU system emulator binary
    #[arg(long, env = "KBDPROBE_QEMU", default_value = "qemu-system-x86_64")]
    qemu: PathBuf,

    /// Bootable raw disk image
    #[arg(long, env = "KBDPROBE_IMAGE", default_value = "build/dist/cool-os-debug.img")]
    image: PathBuf,

    /// Directory receiving the writable firmware variable store
    #[arg(long, env = "KBDPROBE_BUILD_DIR", default_value = "build")]
    build_dir: PathBuf,

    /// Directory searched for OVMF firmware before the system locations
    #[arg(long, env = "KBDPROBE_FIRMWARE_DIR")]
    firmware_dir: Option<PathBuf>,

    /// QMP socket path
    #[arg(long, env = "KBDPROBE_SOCKET", default_value = "qmp.sock")]
    socket: PathBuf,

    /// Overall deadline in seconds
    #[arg(long, env = "KBDPROBE_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// QKeyCode to inject
    #[arg(long, env = "KBDPROBE_KEY", default_value = "a")]
    key: String,

    /// Console line marking the guest idle loop
    #[arg(long, env = "KBDPROBE_IDLE_MARKER", default_value = DEFAULT_IDLE_MARKER)]
    idle_marker: String,

    /// Console line marking a received scancode
    #[arg(long, env = "KBDPROBE_CONFIRM_MARKER", default_value = DEFAULT_CONFIRM_MARKER)]
    confirm_marker: String,

    /// Guest memory size
    #[arg(long, env = "KBDPROBE_MEMORY", default_value = "256M")]
    memory: String,

    /// Run without KVM acceleration
    #[arg(long, env = "KBDPROBE_NO_KVM")]
    no_kvm: bool,

    /// Keep the legacy PS/2 controller enabled
    #[arg(long, env = "KBDPROBE_PS2")]
    ps2: bool,

    /// Enable debug logging
    #[arg(long, env = "KBDPROBE_DEBUG")]
    debug: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.debug {
        "kbdprobe=debug,guest=info"
    } else {
        "kbdprobe=info,guest=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = HarnessConfig {
        control_socket: args.socket.clone(),
        deadline: Duration::from_secs(args.timeout),
        idle_marker: args.idle_marker.clone(),
        confirm_marker: args.confirm_marker.clone(),
        key: args.key.clone(),
        ..HarnessConfig::default()
    };
    let options = QemuOptions {
        qemu: args.qemu,
        image: args.image,
        build_dir: args.build_dir,
        firmware_dir: args.firmware_dir,
        memory: args.memory,
        kvm: !args.no_kvm,
        ps2: args.ps2,
        ..QemuOptions::default()
    };

    let command = match prepare_launch(&options, &config.control_socket) {
        Ok(command) => command,
        Err(e) => return Ok(report(&TestOutcome::Fail(e))),
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let harness = Harness::new(config);
    let outcome = rt.block_on(async {
        tokio::select! {
            outcome = harness.run(&command) => Some(outcome),
            _ = tokio::signal::ctrl_c() => None,
        }
    });

    match outcome {
        Some(outcome) => Ok(report(&outcome)),
        None => {
            // The run future was dropped, which already tore the VM down.
            println!("FAIL: interrupted");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn report(outcome: &TestOutcome) -> ExitCode {
    println!("{}", outcome);
    ExitCode::from(outcome.exit_code())
}
