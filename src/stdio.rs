//! Stream-backed standard I/O for guest modules.
//!
//! Guest-visible reads and writes must return synchronously from the guest's
//! point of view, while the underlying streams are asynchronous. Two pieces
//! bridge the gap: a background pump that continuously drains the caller's
//! stdin into a chunk queue, and a per-descriptor worker that flushes queued
//! writes to the real output stream in submission order.

use crate::runtime::AbortOnDropJoinHandle;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};

/// The standard stream triple supplied by the caller. The host consumes the
/// streams for the duration of one module execution; they are released when
/// the execution's background tasks wind down, on every exit path.
pub struct Stdio {
    pub stdin: Box<dyn AsyncRead + Send + Unpin + 'static>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin + 'static>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin + 'static>,
}

impl Stdio {
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Stdio {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }
}

struct QueueState {
    chunks: VecDeque<Bytes>,
    // consumption offset into the front chunk; consumed bytes are never
    // re-delivered
    cursor: usize,
    closed: bool,
}

/// Ordered byte chunks received from stdin, ahead of the guest's reads.
pub struct StdinQueue {
    state: Mutex<QueueState>,
    readable: Notify,
}

impl StdinQueue {
    fn new() -> Self {
        StdinQueue {
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                cursor: 0,
                closed: false,
            }),
            readable: Notify::new(),
        }
    }

    fn push(&self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.chunks.push_back(bytes);
        drop(state);
        self.readable.notify_waiters();
    }

    /// Marks the terminal "no more data will arrive" state. Chunks already
    /// queued remain readable.
    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.readable.notify_waiters();
    }

    pub fn has_data(&self) -> bool {
        !self.state.lock().unwrap().chunks.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Drain queued bytes into `dst`, returning how many were copied.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = state.chunks.front() else {
                break;
            };
            let avail = &front[state.cursor..];
            let n = avail.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&avail[..n]);
            copied += n;
            if state.cursor + n == front.len() {
                state.chunks.pop_front();
                state.cursor = 0;
            } else {
                state.cursor += n;
            }
        }
        copied
    }

    /// Resolves once the queue has data to deliver or will never have more.
    pub async fn ready(&self) {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            // register before checking, so a push between the check and the
            // await cannot be missed
            notified.as_mut().enable();
            {
                let state = self.state.lock().unwrap();
                if !state.chunks.is_empty() || state.closed {
                    return;
                }
            }
            notified.await;
        }
    }
}

/// Background task continuously draining the caller's stdin stream into a
/// [`StdinQueue`]. Dropping the pump stops the task and releases the stream.
pub struct StdinPump {
    queue: Arc<StdinQueue>,
    _task: AbortOnDropJoinHandle<()>,
}

impl StdinPump {
    pub fn start(mut reader: Box<dyn AsyncRead + Send + Unpin + 'static>) -> Self {
        let queue = Arc::new(StdinQueue::new());
        let sink = Arc::clone(&queue);
        let task = crate::runtime::spawn(async move {
            loop {
                let mut buf = bytes::BytesMut::with_capacity(4096);
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => sink.push(buf.freeze()),
                    Err(e) => {
                        tracing::warn!("stdin stream failed, treating as end of input: {e}");
                        break;
                    }
                }
            }
            sink.close();
        });
        StdinPump {
            queue,
            _task: task,
        }
    }

    pub fn queue(&self) -> Arc<StdinQueue> {
        Arc::clone(&self.queue)
    }
}

enum Job {
    Write(Bytes),
    Flush(oneshot::Sender<()>),
}

/// One output descriptor's write queue. Writes are flushed to the underlying
/// stream in the exact order the guest issued them, even though the guest
/// never awaits an individual write; write failures are swallowed after a
/// warning, matching the semantics of an unreliable console.
pub struct OrderedWriter {
    jobs: mpsc::UnboundedSender<Job>,
    _task: AbortOnDropJoinHandle<()>,
}

impl OrderedWriter {
    pub fn new(name: &'static str, mut writer: Box<dyn AsyncWrite + Send + Unpin + 'static>) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel();
        let task = crate::runtime::spawn(async move {
            let mut dead = false;
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Write(bytes) => {
                        if dead {
                            continue;
                        }
                        if let Err(e) = writer.write_all(&bytes).await {
                            tracing::warn!("{name} write failed, discarding further output: {e}");
                            dead = true;
                        }
                    }
                    Job::Flush(done) => {
                        if !dead {
                            if let Err(e) = writer.flush().await {
                                tracing::warn!(
                                    "{name} flush failed, discarding further output: {e}"
                                );
                                dead = true;
                            }
                        }
                        let _ = done.send(());
                    }
                }
            }
        });
        OrderedWriter { jobs, _task: task }
    }

    /// Enqueue bytes; returns before the underlying write completes.
    pub fn write(&self, bytes: Bytes) {
        let _ = self.jobs.send(Job::Write(bytes));
    }

    /// Resolves once every previously enqueued write has drained.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}
