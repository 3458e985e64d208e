//! Guest console capture.
//!
//! Each captured stream gets a reader thread that forwards raw chunks over a
//! bounded channel. [`ConsoleMonitor::poll_line`] drains what has arrived and
//! never blocks, so the caller can keep watching its deadline and the
//! process. A guest that prints faster than the harness consumes is stalled
//! on its pipe rather than buffered in memory.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};

use crate::framing::LineBuffer;

/// Chunks in flight between the reader threads and the monitor.
const CHANNEL_DEPTH: usize = 64;
const CHUNK_SIZE: usize = 4096;

enum ConsoleEvent {
    Data(usize, Vec<u8>),
    Closed(usize),
}

pub struct ConsoleMonitor {
    rx: Receiver<ConsoleEvent>,
    buffers: Vec<LineBuffer>,
    ready: VecDeque<String>,
    open: usize,
}

impl ConsoleMonitor {
    /// Starts one reader thread per source.
    pub fn spawn<I>(sources: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = Box<dyn Read + Send>>,
    {
        let (tx, rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        let mut buffers = Vec::new();
        for (index, source) in sources.into_iter().enumerate() {
            let tx = tx.clone();
            std::thread::Builder::new()
                .name(format!("kbdprobe-console-{}", index))
                .spawn(move || pump(index, source, tx))?;
            buffers.push(LineBuffer::new());
        }
        let open = buffers.len();
        Ok(Self {
            rx,
            buffers,
            ready: VecDeque::new(),
            open,
        })
    }

    /// Returns the next complete console line, or `None` if none is ready yet.
    pub fn poll_line(&mut self) -> Option<String> {
        if self.ready.is_empty() {
            self.drain();
        }
        self.ready.pop_front()
    }

    /// True once every source hit end-of-file and all complete lines were consumed.
    pub fn is_closed(&mut self) -> bool {
        self.drain();
        self.open == 0 && self.ready.is_empty()
    }

    /// Takes at most one channel's worth of chunks, so a source that keeps
    /// refilling the channel cannot hold the caller here.
    fn drain(&mut self) {
        for _ in 0..CHANNEL_DEPTH {
            match self.rx.try_recv() {
                Ok(ConsoleEvent::Data(index, bytes)) => {
                    let buffer = &mut self.buffers[index];
                    buffer.extend(&bytes);
                    while let Some(line) = buffer.pop_line() {
                        self.ready
                            .push_back(String::from_utf8_lossy(&line).into_owned());
                    }
                }
                Ok(ConsoleEvent::Closed(index)) => {
                    if self.buffers[index].pending() > 0 {
                        tracing::debug!(
                            stream = index,
                            bytes = self.buffers[index].pending(),
                            "console stream closed with an unterminated line"
                        );
                    }
                    self.open -= 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

fn pump(index: usize, mut source: Box<dyn Read + Send>, tx: SyncSender<ConsoleEvent>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(stream = index, error = %e, "console read failed");
                break;
            }
        };
        if tx.send(ConsoleEvent::Data(index, buf[..n].to_vec())).is_err() {
            return;
        }
    }
    let _ = tx.send(ConsoleEvent::Closed(index));
}
