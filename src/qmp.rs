//! Minimal QMP (QEMU Machine Protocol) client.
//!
//! Only what the harness needs: connect, capability negotiation and
//! `send-key`. Messages are single-line JSON objects; a read takes exactly one
//! line and a line that fails to parse is fatal, the channel is never
//! resynchronized.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::HarnessError;
use crate::framing::LineBuffer;
use crate::util::RetryPolicy;

/// One QMP object, request or reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<Value>,
    /// Present only on the server greeting.
    #[serde(rename = "QMP", default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ControlMessage {
    pub fn command(name: &str) -> Self {
        Self {
            execute: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_arguments(mut self, arguments: Option<Map<String, Value>>) -> Self {
        self.arguments = arguments;
        self
    }

    /// `send-key` with a single QKeyCode.
    pub fn send_key(code: &str) -> Self {
        let mut arguments = Map::new();
        arguments.insert(
            "keys".to_string(),
            json!([{ "type": "qcode", "data": code }]),
        );
        Self::command("send-key").with_arguments(Some(arguments))
    }

    /// Parses one line, without its terminator.
    pub fn parse(line: &[u8]) -> Result<Self, HarnessError> {
        serde_json::from_slice(line).map_err(|e| {
            HarnessError::protocol(format!(
                "malformed control message {:?}: {}",
                String::from_utf8_lossy(line),
                e
            ))
        })
    }

    /// Serializes to a single newline-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>, HarnessError> {
        let mut bytes = serde_json::to_vec(self).map_err(|e| {
            HarnessError::protocol(format!("failed to encode control message: {}", e))
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn is_greeting(&self) -> bool {
        self.greeting.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.ret.is_some() || self.error.is_some()
    }
}

/// An open control connection.
pub struct ControlChannel<S> {
    stream: S,
    lines: LineBuffer,
    round_trip: Duration,
}

/// Connects to the control socket, retrying while the VM has not created its
/// listener yet.
pub async fn connect_with_retry(
    path: &Path,
    policy: &RetryPolicy,
    round_trip: Duration,
) -> Result<ControlChannel<UnixStream>, HarnessError> {
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => {
                tracing::debug!(attempt, path = %path.display(), "control socket connected");
                return Ok(ControlChannel::new(stream, round_trip));
            }
            Err(source) if attempt >= attempts => {
                return Err(HarnessError::ControlConnect {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                let delay = policy.backoff(attempt);
                tracing::debug!(attempt, error = %e, ?delay, "control socket not ready");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, round_trip: Duration) -> Self {
        Self {
            stream,
            lines: LineBuffer::new(),
            round_trip,
        }
    }

    /// Reads exactly one message. Cancel safe: bytes already received stay
    /// buffered for the next call.
    pub async fn read_message(&mut self) -> Result<ControlMessage, HarnessError> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(line) = self.lines.pop_line() {
                tracing::debug!(line = %String::from_utf8_lossy(&line), "qmp <-");
                return ControlMessage::parse(&line);
            }
            let n = self.stream.read(&mut buf).await.map_err(|e| {
                HarnessError::protocol(format!("control channel read failed: {}", e))
            })?;
            if n == 0 {
                return Err(HarnessError::protocol("control channel closed by peer"));
            }
            self.lines.extend(&buf[..n]);
        }
    }

    pub async fn send(&mut self, message: &ControlMessage) -> Result<(), HarnessError> {
        let bytes = message.encode()?;
        tracing::debug!(line = %String::from_utf8_lossy(&bytes).trim_end(), "qmp ->");
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| HarnessError::protocol(format!("control channel write failed: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| HarnessError::protocol(format!("control channel flush failed: {}", e)))
    }

    /// Reads the greeting and negotiates capabilities. Returns the greeting's
    /// `QMP` payload.
    pub async fn handshake(&mut self) -> Result<Value, HarnessError> {
        let greeting = within(self.round_trip, "greeting", self.read_message()).await?;
        let Some(info) = greeting.greeting else {
            return Err(HarnessError::protocol(format!(
                "expected QMP greeting, got {}",
                serde_json::to_string(&greeting).unwrap_or_default()
            )));
        };
        let ack = self.execute("qmp_capabilities", None).await?;
        if ack.ret.is_none() {
            return Err(HarnessError::protocol(
                "qmp_capabilities acknowledgement has no return field",
            ));
        }
        Ok(info)
    }

    /// Issues a command and waits for its reply, skipping events.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ControlMessage, HarnessError> {
        let request = ControlMessage::command(command).with_arguments(arguments);
        self.request(&request).await
    }

    /// Injects one key press. Any reply satisfies the wait.
    pub async fn send_key(&mut self, code: &str) -> Result<(), HarnessError> {
        self.request(&ControlMessage::send_key(code)).await?;
        Ok(())
    }

    async fn request(&mut self, request: &ControlMessage) -> Result<ControlMessage, HarnessError> {
        let command = request.execute.clone().unwrap_or_default();
        let round_trip = self.round_trip;
        within(round_trip, &command, async {
            self.send(request).await?;
            self.await_response(&command).await
        })
        .await
    }

    async fn await_response(&mut self, command: &str) -> Result<ControlMessage, HarnessError> {
        loop {
            let message = self.read_message().await?;
            if let Some(error) = &message.error {
                let desc = error
                    .get("desc")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(HarnessError::protocol(format!(
                    "{} rejected: {}",
                    command, desc
                )));
            }
            if message.is_response() || message.is_greeting() {
                return Ok(message);
            }
            tracing::debug!(
                event = message.event.as_deref().unwrap_or("<unknown>"),
                "skipping asynchronous notification"
            );
        }
    }
}

async fn within<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, HarnessError>
where
    F: Future<Output = Result<T, HarnessError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(HarnessError::protocol(format!(
            "{} timed out after {:?}",
            what, limit
        ))),
    }
}
