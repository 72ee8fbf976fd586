//! Serial transport manager.
//!
//! Owns the selected device, its read and write halves and the background
//! read task. All failures are absorbed here and surfaced as a boolean from
//! `connect` or as `last_error` in the published snapshot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use super::decoder::Utf8ChunkDecoder;
use super::interface::{BoxedReader, BoxedWriter, SerialBackend, SerialDevice};
use super::{DeviceDescriptor, Result, SerialError, DEFAULT_BAUD_RATE};

const DISCONNECTED_INFO: &str = "Disconnected";
const DEFAULT_READ_BUFFER: usize = 1024;
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One decoded read from the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingChunk {
    pub seq: u64,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Observable state published on every transition and every chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub connected: bool,
    pub device_info: String,
    pub incoming_data: String,
    pub error: Option<String>,
    pub baud_rate: Option<u32>,
    pub descriptor: Option<DeviceDescriptor>,
    pub session_id: Option<Uuid>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected: false,
            device_info: DISCONNECTED_INFO.to_string(),
            incoming_data: String::new(),
            error: None,
            baud_rate: None,
            descriptor: None,
            session_id: None,
            connected_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportMetrics {
    pub chunks_read: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub lines_sent: u64,
    pub utf8_decode_errors: u64,
    pub write_failures: u64,
    pub read_failures: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub last_error: Option<String>,
}

/// Why the read loop stopped
#[derive(Debug)]
enum ReaderExit {
    Stopped,
    EndOfStream,
    Failed(String),
}

struct Session {
    id: Uuid,
    device: Box<dyn SerialDevice>,
    stop_tx: Option<oneshot::Sender<()>>,
    reader_task: Option<JoinHandle<()>>,
}

struct Inner {
    backend: Arc<dyn SerialBackend>,
    read_buffer_size: usize,
    session: Mutex<Option<Session>>,
    writer: Mutex<Option<BoxedWriter>>,
    /// Raised when teardown begins; pending writes give up the writer
    closing_tx: watch::Sender<bool>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<IncomingChunk>>>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    metrics_tx: watch::Sender<TransportMetrics>,
    next_seq: std::sync::atomic::AtomicU64,
}

/// Single owner of the serial connection
pub struct SerialManager {
    inner: Arc<Inner>,
}

impl SerialManager {
    pub fn new(backend: Arc<dyn SerialBackend>) -> Self {
        Self::with_read_buffer(backend, DEFAULT_READ_BUFFER)
    }

    pub fn with_read_buffer(backend: Arc<dyn SerialBackend>, read_buffer_size: usize) -> Self {
        let (state_tx, _state_rx) = watch::channel(ConnectionSnapshot::default());
        let (metrics_tx, _metrics_rx) = watch::channel(TransportMetrics::default());
        let (closing_tx, _closing_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                backend,
                read_buffer_size: read_buffer_size.max(1),
                session: Mutex::new(None),
                writer: Mutex::new(None),
                closing_tx,
                subscribers: Mutex::new(Vec::new()),
                state_tx,
                metrics_tx,
                next_seq: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    pub async fn connect_default(&self) -> bool {
        self.connect(DEFAULT_BAUD_RATE).await
    }

    /// Select, open and start reading from a device.
    /// Returns false on any failure, with the cause in `error()`.
    pub async fn connect(&self, baud_rate: u32) -> bool {
        let mut session_guard = self.inner.session.lock().await;
        if session_guard.is_some() {
            log::warn!("{}, ignoring connect request", SerialError::AlreadyConnected);
            return false;
        }

        self.inner.state_tx.send_modify(|s| {
            s.error = None;
            s.state = ConnectionState::Connecting;
        });
        let mut rollback = ConnectRollback {
            state_tx: &self.inner.state_tx,
            armed: true,
        };

        match self.open_session(baud_rate).await {
            Ok((session, descriptor, reader)) => {
                rollback.armed = false;
                let session_id = session.id;
                let now = Utc::now();
                let device_info = descriptor.summary(baud_rate);
                *session_guard = Some(session);

                self.inner.state_tx.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.connected = true;
                    s.device_info = device_info;
                    s.incoming_data.clear();
                    s.error = None;
                    s.baud_rate = Some(baud_rate);
                    s.descriptor = Some(descriptor.clone());
                    s.session_id = Some(session_id);
                    s.connected_at = Some(now);
                });
                self.inner.metrics_tx.send_modify(|m| m.sessions_opened += 1);

                // Spawn only after the session is stored so a fast failure
                // teardown always finds it.
                let (stop_tx, stop_rx) = oneshot::channel();
                let task = tokio::spawn(read_loop(self.inner.clone(), session_id, reader, stop_rx));
                if let Some(session) = session_guard.as_mut() {
                    session.stop_tx = Some(stop_tx);
                    session.reader_task = Some(task);
                }

                log::info!(
                    "Connected to {} at {} baud (session {})",
                    descriptor.port_name,
                    baud_rate,
                    session_id
                );
                true
            }
            Err(e) => {
                rollback.armed = false;
                let message = e.to_string();
                log::error!("Serial connection failed: {}", message);
                self.inner.state_tx.send_modify(|s| {
                    *s = ConnectionSnapshot {
                        error: Some(message.clone()),
                        ..ConnectionSnapshot::default()
                    };
                });
                self.inner.metrics_tx.send_modify(|m| m.last_error = Some(message));
                false
            }
        }
    }

    async fn open_session(
        &self,
        baud_rate: u32,
    ) -> Result<(Session, DeviceDescriptor, BoxedReader)> {
        self.inner.backend.is_available().await?;

        if baud_rate == 0 {
            return Err(SerialError::OpenFailure("baud rate must be positive".to_string()));
        }

        let mut device = self.inner.backend.request_port().await?;
        let descriptor = device.descriptor();
        let link = device.open(baud_rate).await?;

        let mut writer_guard = self.inner.writer.lock().await;
        self.inner.closing_tx.send_replace(false);
        *writer_guard = Some(link.writer);
        drop(writer_guard);

        let session = Session {
            id: Uuid::new_v4(),
            device,
            stop_tx: None,
            reader_task: None,
        };
        Ok((session, descriptor, link.reader))
    }

    /// Tear down the connection. Safe to call at any time, never fails.
    pub async fn disconnect(&self) {
        // Held for the whole teardown so a concurrent connect cannot interleave
        let mut session_guard = self.inner.session.lock().await;
        match session_guard.take() {
            Some(session) => {
                log::info!("Disconnecting session {}", session.id);
                self.inner.teardown(session, true, None).await;
            }
            None => log::debug!("Disconnect requested while not connected"),
        }
    }

    /// Write one line to the device. No-op while disconnected.
    pub async fn send(&self, text: &str) {
        let mut closing_rx = self.inner.closing_tx.subscribe();
        let mut writer_guard = tokio::select! {
            biased;
            _ = closing(&mut closing_rx) => {
                log::debug!("Dropping send during teardown: {:?}", text);
                return;
            }
            guard = self.inner.writer.lock() => guard,
        };
        let Some(writer) = writer_guard.as_mut() else {
            log::debug!("Dropping send while disconnected: {:?}", text);
            return;
        };

        let line = format!("{}\n", text);
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            res = write => res,
            _ = closing(&mut closing_rx) => {
                log::warn!("Abandoned write of {:?}: link is closing", text);
                return;
            }
        };

        match result {
            Ok(()) => {
                log::debug!("Sent {:?}", text);
                self.inner.metrics_tx.send_modify(|m| {
                    m.bytes_written += line.len() as u64;
                    m.lines_sent += 1;
                });
            }
            Err(e) => {
                let err = SerialError::WriteFailure(e.to_string());
                log::error!("{}", err);
                self.inner.metrics_tx.send_modify(|m| {
                    m.write_failures += 1;
                    m.last_error = Some(err.to_string());
                });
            }
        }
    }

    /// Ordered, lossless feed of every decoded chunk from now on
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<IncomingChunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().await.push(tx);
        rx
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.state_tx.subscribe()
    }

    pub fn watch_metrics(&self) -> watch::Receiver<TransportMetrics> {
        self.inner.metrics_tx.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.state_tx.borrow().clone()
    }

    pub fn metrics(&self) -> TransportMetrics {
        self.inner.metrics_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state_tx.borrow().connected
    }

    pub fn device_info(&self) -> String {
        self.inner.state_tx.borrow().device_info.clone()
    }

    /// Latest chunk only; use `subscribe` to see every chunk
    pub fn incoming_data(&self) -> String {
        self.inner.state_tx.borrow().incoming_data.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state_tx.borrow().error.clone()
    }
}

impl Drop for SerialManager {
    fn drop(&mut self) {
        let Ok(mut guard) = self.inner.session.try_lock() else {
            log::warn!("Serial manager dropped during a lifecycle call, skipping teardown");
            return;
        };
        let Some(mut session) = guard.take() else {
            return;
        };
        drop(guard);

        // Stop reading right away; the rest needs an async context
        if let Some(stop_tx) = session.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    inner.teardown(session, true, None).await;
                });
            }
            Err(_) => {
                if let Some(task) = session.reader_task.take() {
                    task.abort();
                }
                log::warn!("No runtime available, session {} dropped without close", session.id);
            }
        }
    }
}

impl Inner {
    /// Release handles, close the device and publish the Disconnected state.
    /// `join_reader` is false when called on behalf of the reader itself.
    async fn teardown(&self, mut session: Session, join_reader: bool, error: Option<String>) {
        // Writer goes first so nothing is written once teardown has begun.
        // Raising the flag makes a blocked send release the writer lock.
        self.closing_tx.send_replace(true);
        let writer = self.writer.lock().await.take();

        if let Some(stop_tx) = session.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = session.reader_task.take() {
            if join_reader {
                let abort = task.abort_handle();
                if timeout(READER_JOIN_TIMEOUT, task).await.is_err() {
                    log::warn!("Reader for session {} did not stop in time, aborting", session.id);
                    abort.abort();
                }
            }
        }

        drop(writer);

        if let Err(e) = session.device.close().await {
            let err = SerialError::TeardownFailure(e.to_string());
            log::warn!("{}", err);
        }

        self.state_tx.send_modify(|s| {
            *s = ConnectionSnapshot {
                error: error.clone(),
                ..ConnectionSnapshot::default()
            };
        });
        self.metrics_tx.send_modify(|m| {
            m.sessions_closed += 1;
            if error.is_some() {
                m.last_error = error.clone();
            }
        });
        log::info!("Session {} closed", session.id);
    }

    /// Tear down after the reader stopped on its own (EOF or error).
    /// Ignores the request when the session was already replaced or removed.
    async fn teardown_after_reader_exit(&self, session_id: Uuid, error: Option<String>) {
        let mut guard = self.session.lock().await;
        if !matches!(guard.as_ref(), Some(s) if s.id == session_id) {
            return;
        }
        if let Some(session) = guard.take() {
            self.teardown(session, false, error).await;
        }
    }

    async fn publish(&self, text: String) {
        let seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let chunk = IncomingChunk {
            seq,
            text,
            received_at: Utc::now(),
        };

        let latest = chunk.text.clone();
        self.state_tx.send_modify(|s| s.incoming_data = latest);

        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(chunk.clone()).is_ok());
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    session_id: Uuid,
    mut reader: BoxedReader,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut decoder = Utf8ChunkDecoder::new();
    let mut buf = vec![0u8; inner.read_buffer_size];

    let exit = loop {
        tokio::select! {
            // Polled first so a pending stop always wins over buffered data
            biased;
            _ = &mut stop_rx => break ReaderExit::Stopped,
            res = reader.read(&mut buf) => match res {
                Ok(0) => break ReaderExit::EndOfStream,
                Ok(n) => {
                    let errors_before = decoder.decode_errors();
                    let text = decoder.decode(&buf[..n]);
                    let new_errors = decoder.decode_errors() - errors_before;
                    inner.metrics_tx.send_modify(|m| {
                        m.chunks_read += 1;
                        m.bytes_read += n as u64;
                        m.utf8_decode_errors += new_errors;
                    });
                    log::debug!("Read {} bytes", n);
                    if !text.is_empty() {
                        inner.publish(text).await;
                    }
                }
                Err(e) => break ReaderExit::Failed(e.to_string()),
            },
        }
    };

    // Release the read half before anything else happens to the device
    drop(reader);

    if !matches!(exit, ReaderExit::Stopped) && decoder.has_pending() {
        let tail = decoder.finish();
        if !tail.is_empty() {
            inner.publish(tail).await;
        }
    }

    match exit {
        ReaderExit::Stopped => log::debug!("Reader for session {} stopped", session_id),
        ReaderExit::EndOfStream => {
            log::info!("Device closed the stream (session {})", session_id);
            spawn_reader_teardown(inner, session_id, None);
        }
        ReaderExit::Failed(message) => {
            let err = SerialError::ReadFailure(message);
            log::error!("{}", err);
            inner.metrics_tx.send_modify(|m| m.read_failures += 1);
            spawn_reader_teardown(inner, session_id, Some(err.to_string()));
        }
    }
}

/// Resets a `Connecting` snapshot when a connect future is dropped mid-way
struct ConnectRollback<'a> {
    state_tx: &'a watch::Sender<ConnectionSnapshot>,
    armed: bool,
}

impl Drop for ConnectRollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("Connect attempt cancelled before completion");
            self.state_tx.send_modify(|s| {
                *s = ConnectionSnapshot {
                    error: Some("Connection attempt cancelled".to_string()),
                    ..ConnectionSnapshot::default()
                };
            });
        }
    }
}

async fn closing(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closing| *closing).await;
}

// A disconnect() may be holding the session lock while it joins this task,
// so the follow-up teardown must run on its own task.
fn spawn_reader_teardown(inner: Arc<Inner>, session_id: Uuid, error: Option<String>) {
    tokio::spawn(async move {
        inner.teardown_after_reader_exit(session_id, error).await;
    });
}
