//! The orchestrator: one cooperative loop over process liveness, console
//! output and the wall-clock deadline.

use tokio::net::UnixStream;
use tokio::time::Instant;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, TestOutcome};
use crate::milestone::{BootMilestones, Step};
use crate::qmp::{self, ControlChannel};
use crate::supervisor::{self, VmCommand, VmProcess};

/// Console lines handled per loop iteration before the deadline and process
/// state are checked again.
const LINES_PER_TICK: usize = 256;

pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    /// Boots the VM, drives it to a verdict and tears it down.
    pub async fn run(&self, command: &VmCommand) -> TestOutcome {
        let mut vm = match supervisor::launch(
            command,
            &self.config.control_socket,
            self.config.teardown_grace,
        ) {
            Ok(vm) => vm,
            Err(e) => return TestOutcome::Fail(e),
        };
        let outcome = self.drive(&mut vm).await;
        // The grace wait sleeps; keep it off the runtime's worker.
        if let Err(e) = tokio::task::spawn_blocking(move || vm.terminate()).await {
            tracing::warn!(error = %e, "vm teardown task failed");
        }
        outcome
    }

    async fn drive(&self, vm: &mut VmProcess) -> TestOutcome {
        let deadline = Instant::now() + self.config.deadline;
        let mut machine = BootMilestones::new(self.config.markers());
        // Held open until teardown so the connection outlives the key press.
        let mut channel: Option<ControlChannel<UnixStream>> = None;

        while !machine.is_finished() {
            let alive = vm.is_alive();

            let mut handled = 0;
            while handled < LINES_PER_TICK {
                let Some(line) = vm.poll_line() else {
                    break;
                };
                handled += 1;
                tracing::info!(target: "guest", "{}", line);
                if machine.observe_line(&line) == Step::OpenChannel {
                    match self.inject_key(deadline).await {
                        Ok(open) => {
                            channel = Some(open);
                            machine.key_delivered();
                        }
                        Err(e) => machine.fail(e),
                    }
                }
                if machine.is_finished() {
                    break;
                }
            }
            if machine.is_finished() {
                break;
            }

            // Output written just before exit may still be in flight; only
            // give up once the console has been drained.
            if !alive && vm.console_closed() {
                let status = vm
                    .exit_status()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown status".to_string());
                machine.process_exited(status);
                break;
            }
            if Instant::now() >= deadline {
                machine.deadline_elapsed(self.config.deadline);
                break;
            }
            if handled == LINES_PER_TICK {
                // More output is likely queued; come back without sleeping.
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        drop(channel);
        machine
            .into_outcome()
            .unwrap_or(TestOutcome::Fail(HarnessError::Timeout(self.config.deadline)))
    }

    /// Connects, negotiates and sends the key, all within the remaining run
    /// budget.
    async fn inject_key(&self, deadline: Instant) -> Result<ControlChannel<UnixStream>, HarnessError> {
        let attempt = async {
            let mut channel = qmp::connect_with_retry(
                &self.config.control_socket,
                &self.config.connect_retry,
                self.config.round_trip_timeout,
            )
            .await?;
            channel.handshake().await?;
            tracing::info!(key = %self.config.key, "sending key");
            channel.send_key(&self.config.key).await?;
            Ok::<_, HarnessError>(channel)
        };
        match tokio::time::timeout_at(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::Timeout(self.config.deadline)),
        }
    }
}
