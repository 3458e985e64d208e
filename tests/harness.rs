//! End-to-end runs of the harness against a scripted stand-in VM.
//!
//! The "VM" is a `sh` script that prints guest console lines. A fake QMP
//! server runs in the test process and binds the control socket once the
//! script reports it is booting, mirroring QEMU creating its listener after
//! launch. Files in the rig directory sequence the two sides.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kbdprobe::{
    FailureKind, Harness, HarnessConfig, QemuOptions, RetryPolicy, TestOutcome, VmCommand,
    prepare_launch,
};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

const GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 9}, "package": ""}, "capabilities": []}}"#;

const BOOT_TO_IDLE: &str = r#"
touch booting
while [ ! -e qmp-ready ]; do sleep 0.02; done
echo "cool-os: kernel loaded"
echo "cool-os: enabling interrupts"
echo "cool-os: entering idle loop"
"#;

const REPORT_SCANCODE: &str = r#"
while [ ! -e key-received ]; do sleep 0.02; done
echo "KBD: Scancode: 0x1E"
echo "KBD: Scancode: 0x9E"
"#;

const HANG: &str = "exec sleep 30\n";

struct Rig {
    dir: TempDir,
}

impl Rig {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn socket(&self) -> PathBuf {
        self.path("qmp.sock")
    }

    fn config(&self, deadline: Duration) -> HarnessConfig {
        HarnessConfig {
            control_socket: self.socket(),
            deadline,
            poll_interval: Duration::from_millis(10),
            round_trip_timeout: Duration::from_secs(2),
            connect_retry: RetryPolicy {
                max_attempts: 20,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
            },
            teardown_grace: Duration::from_secs(2),
            ..HarnessConfig::default()
        }
    }

    /// A stand-in VM running `body` inside the rig directory.
    fn vm(&self, body: &str) -> VmCommand {
        let script = format!(
            "cd '{}' || exit 99\necho $$ > vm.pid\n{}",
            self.dir.path().display(),
            body
        );
        VmCommand::new("sh").arg("-c").arg(script)
    }

    fn vm_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.path("vm.pid"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn reset_flags(&self) {
        for flag in ["booting", "qmp-ready", "key-received", "vm.pid"] {
            let _ = std::fs::remove_file(self.path(flag));
        }
    }

    fn assert_torn_down(&self) {
        assert!(!self.socket().exists(), "control socket left behind");
        if let Some(pid) = self.vm_pid() {
            assert!(
                kill(Pid::from_raw(pid), None).is_err(),
                "vm process {pid} still running"
            );
        }
    }
}

#[derive(Default)]
struct QmpStats {
    connections: AtomicUsize,
    send_keys: AtomicUsize,
}

/// Binds the control socket once the VM reports it is booting and answers
/// like QEMU would.
fn spawn_fake_qmp(dir: &Path, greeting: &'static str, stats: Arc<QmpStats>) -> JoinHandle<()> {
    let dir = dir.to_path_buf();
    tokio::spawn(async move {
        while !dir.join("booting").exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let listener = UnixListener::bind(dir.join("qmp.sock")).unwrap();
        std::fs::write(dir.join("qmp-ready"), b"").unwrap();

        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        stats.connections.fetch_add(1, Ordering::SeqCst);
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        if write.write_all(format!("{greeting}\n").as_bytes()).await.is_err() {
            return;
        }

        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let reply = match request["execute"].as_str() {
                Some("qmp_capabilities") => r#"{"return": {}}"#.to_string(),
                Some("send-key") => {
                    stats.send_keys.fetch_add(1, Ordering::SeqCst);
                    format!(
                        "{}\n{}",
                        r#"{"timestamp": {"seconds": 1, "microseconds": 0}, "event": "NIC_RX_FILTER_CHANGED", "data": {}}"#,
                        r#"{"return": {}}"#
                    )
                }
                _ => r#"{"error": {"class": "CommandNotFound", "desc": "unknown"}}"#.to_string(),
            };
            if write.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                return;
            }
            if request["execute"] == "send-key" {
                std::fs::write(dir.join("key-received"), b"").unwrap();
            }
        }
    })
}

fn kind(outcome: &TestOutcome) -> Option<FailureKind> {
    outcome.failure_kind()
}

#[tokio::test]
async fn test_pass_when_scancode_follows_key() {
    let rig = Rig::new();
    let stats = Arc::new(QmpStats::default());
    spawn_fake_qmp(rig.dir.path(), GREETING, stats.clone());

    let outcome = Harness::new(rig.config(Duration::from_secs(20)))
        .run(&rig.vm(&format!("{BOOT_TO_IDLE}{REPORT_SCANCODE}{HANG}")))
        .await;

    assert!(outcome.is_pass(), "{outcome}");
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(stats.send_keys.load(Ordering::SeqCst), 1);
    rig.assert_torn_down();
}

#[tokio::test]
async fn test_timeout_without_idle_marker_never_connects() {
    let rig = Rig::new();
    let stats = Arc::new(QmpStats::default());
    spawn_fake_qmp(rig.dir.path(), GREETING, stats.clone());

    let script = r#"
touch booting
while [ ! -e qmp-ready ]; do sleep 0.02; done
echo "cool-os: kernel loaded"
echo "PROTO7 TEST3: Fault isolation"
exec sleep 30
"#;
    let started = Instant::now();
    let outcome = Harness::new(rig.config(Duration::from_secs(1)))
        .run(&rig.vm(script))
        .await;

    assert_eq!(kind(&outcome), Some(FailureKind::Timeout), "{outcome}");
    assert_eq!(outcome.exit_code(), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(stats.connections.load(Ordering::SeqCst), 0);
    assert_eq!(stats.send_keys.load(Ordering::SeqCst), 0);
    rig.assert_torn_down();
}

#[tokio::test]
async fn test_timeout_without_confirmation_sends_one_key() {
    let rig = Rig::new();
    let stats = Arc::new(QmpStats::default());
    spawn_fake_qmp(rig.dir.path(), GREETING, stats.clone());

    let outcome = Harness::new(rig.config(Duration::from_secs(2)))
        .run(&rig.vm(&format!("{BOOT_TO_IDLE}echo 'cool-os: entering idle loop'\n{HANG}")))
        .await;

    assert_eq!(kind(&outcome), Some(FailureKind::Timeout), "{outcome}");
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 1);
    assert_eq!(stats.send_keys.load(Ordering::SeqCst), 1);
    rig.assert_torn_down();
}

#[tokio::test]
async fn test_unreachable_control_socket() {
    let rig = Rig::new();
    let mut config = rig.config(Duration::from_secs(10));
    config.connect_retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
    };

    let started = Instant::now();
    let outcome = Harness::new(config)
        .run(&rig.vm(&format!("echo 'cool-os: entering idle loop'\n{HANG}")))
        .await;

    assert_eq!(kind(&outcome), Some(FailureKind::ControlConnect), "{outcome}");
    assert_eq!(outcome.exit_code(), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    rig.assert_torn_down();
}

#[tokio::test]
async fn test_malformed_greeting_is_protocol_error() {
    let rig = Rig::new();
    let stats = Arc::new(QmpStats::default());
    spawn_fake_qmp(rig.dir.path(), r#"{"QMP": {"version"#, stats.clone());

    let outcome = Harness::new(rig.config(Duration::from_secs(10)))
        .run(&rig.vm(&format!("{BOOT_TO_IDLE}{HANG}")))
        .await;

    assert_eq!(kind(&outcome), Some(FailureKind::Protocol), "{outcome}");
    assert_eq!(stats.send_keys.load(Ordering::SeqCst), 0);
    rig.assert_torn_down();
}

#[tokio::test]
async fn test_early_exit_is_process_exited() {
    let rig = Rig::new();
    let outcome = Harness::new(rig.config(Duration::from_secs(10)))
        .run(&rig.vm("echo 'cool-os: kernel loaded'\necho 'PANIC: page fault' >&2\nexit 7\n"))
        .await;

    assert_eq!(kind(&outcome), Some(FailureKind::ProcessExited), "{outcome}");
    assert!(outcome.to_string().contains('7'));
    rig.assert_torn_down();
}

#[tokio::test]
async fn test_missing_executable_is_launch_error() {
    let rig = Rig::new();
    let outcome = Harness::new(rig.config(Duration::from_secs(5)))
        .run(&VmCommand::new(rig.path("no-such-qemu")))
        .await;

    assert_eq!(kind(&outcome), Some(FailureKind::Launch), "{outcome}");
    assert_eq!(outcome.exit_code(), 1);
    assert!(!rig.socket().exists());
}

#[test]
fn test_missing_firmware_stops_before_launch() {
    let rig = Rig::new();
    let image = rig.path("cool-os-debug.img");
    std::fs::write(&image, b"disk").unwrap();
    let empty = rig.path("firmware");
    std::fs::create_dir_all(&empty).unwrap();

    let options = QemuOptions {
        image,
        build_dir: rig.path("build"),
        firmware_dir: Some(empty),
        firmware_search_dirs: Vec::new(),
        ..QemuOptions::default()
    };
    let err = prepare_launch(&options, &rig.socket()).unwrap_err();
    let outcome = TestOutcome::Fail(err);

    assert_eq!(kind(&outcome), Some(FailureKind::Precondition));
    assert_eq!(outcome.exit_code(), 1);
    assert!(!rig.socket().exists());
    assert!(!rig.path("build").exists());
}

#[tokio::test]
async fn test_back_to_back_runs_need_no_cleanup() {
    let rig = Rig::new();
    // Leftover from an aborted run.
    std::fs::write(rig.socket(), b"").unwrap();

    for run in 0..2 {
        rig.reset_flags();
        let stats = Arc::new(QmpStats::default());
        let server = spawn_fake_qmp(rig.dir.path(), GREETING, stats.clone());

        let outcome = Harness::new(rig.config(Duration::from_secs(20)))
            .run(&rig.vm(&format!("{BOOT_TO_IDLE}{REPORT_SCANCODE}{HANG}")))
            .await;

        assert!(outcome.is_pass(), "run {run}: {outcome}");
        assert_eq!(stats.send_keys.load(Ordering::SeqCst), 1);
        rig.assert_torn_down();
        server.abort();
    }
}

#[tokio::test]
async fn test_confirmation_just_before_exit_passes() {
    let rig = Rig::new();
    let stats = Arc::new(QmpStats::default());
    spawn_fake_qmp(rig.dir.path(), GREETING, stats.clone());

    let script = format!(
        "{BOOT_TO_IDLE}\nwhile [ ! -e key-received ]; do sleep 0.02; done\necho 'KBD: Scancode: 0x1E'\nexit 0\n"
    );
    let outcome = Harness::new(rig.config(Duration::from_secs(20)))
        .run(&rig.vm(&script))
        .await;

    assert!(outcome.is_pass(), "{outcome}");
    assert_eq!(stats.send_keys.load(Ordering::SeqCst), 1);
    rig.assert_torn_down();
}

#[tokio::test]
async fn test_console_flood_still_hits_deadline() {
    let rig = Rig::new();
    let harness = Harness::new(rig.config(Duration::from_secs(1)));
    let vm = rig.vm("exec yes 'cool-os: panic loop'\n");

    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(20), harness.run(&vm))
        .await
        .expect("run did not return under a console flood");

    assert_eq!(kind(&outcome), Some(FailureKind::Timeout), "{outcome}");
    assert!(started.elapsed() < Duration::from_secs(10));
    rig.assert_torn_down();
}

#[tokio::test]
async fn test_teardown_grace_does_not_stall_runtime() {
    let rig = Rig::new();
    let mut config = rig.config(Duration::from_millis(300));
    config.teardown_grace = Duration::from_millis(800);

    let longest_gap = Arc::new(Mutex::new(Duration::ZERO));
    let ticker = {
        let longest_gap = longest_gap.clone();
        tokio::spawn(async move {
            let mut last = Instant::now();
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let now = Instant::now();
                let mut longest = longest_gap.lock().unwrap();
                *longest = (*longest).max(now - last);
                last = now;
            }
        })
    };

    let started = Instant::now();
    let outcome = Harness::new(config)
        .run(&rig.vm("trap '' TERM\nwhile :; do sleep 0.05; done\n"))
        .await;
    ticker.abort();

    assert_eq!(kind(&outcome), Some(FailureKind::Timeout), "{outcome}");
    // SIGTERM is ignored, so the whole grace period was spent.
    assert!(started.elapsed() >= Duration::from_millis(800));
    assert!(*longest_gap.lock().unwrap() < Duration::from_millis(400));
    rig.assert_torn_down();
}
