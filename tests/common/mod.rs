#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};

use marauder_console_lib::serial::{
    DeviceDescriptor, Result, SerialBackend, SerialDevice, SerialError, SerialLink,
};

/// Counters shared by a fake backend and every device it hands out
#[derive(Default)]
pub struct Counters {
    pub requests: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub writes: AtomicUsize,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

/// In-memory backend; the far end of each opened link is handed to the test
pub struct FakeBackend {
    pub counters: Arc<Counters>,
    pub available: AtomicBool,
    pub cancel_selection: AtomicBool,
    pub fail_open: AtomicBool,
    pub fail_writes: Arc<AtomicBool>,
    pub fail_close: AtomicBool,
    pub descriptor: DeviceDescriptor,
    peers_tx: mpsc::UnboundedSender<DuplexStream>,
    peers_rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            counters: Arc::new(Counters::default()),
            available: AtomicBool::new(true),
            cancel_selection: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            fail_writes: Arc::new(AtomicBool::new(false)),
            fail_close: AtomicBool::new(false),
            descriptor: DeviceDescriptor {
                port_name: "/dev/fake0".to_string(),
                vid: Some(0x10C4),
                pid: Some(0xEA60),
                serial_number: None,
                manufacturer: Some("Silicon Labs".to_string()),
                product: None,
            },
            peers_tx,
            peers_rx: Mutex::new(peers_rx),
        })
    }

    /// Device-side end of the most recently opened link
    pub async fn next_peer(&self) -> DuplexStream {
        tokio::time::timeout(Duration::from_secs(1), self.peers_rx.lock().await.recv())
            .await
            .expect("a link was opened")
            .expect("backend alive")
    }
}

#[async_trait::async_trait]
impl SerialBackend for FakeBackend {
    async fn is_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SerialError::CapabilityUnavailable(
                "serial access is not supported by this host".to_string(),
            ))
        }
    }

    async fn request_port(&self) -> Result<Box<dyn SerialDevice>> {
        self.counters.requests.fetch_add(1, Ordering::SeqCst);
        if self.cancel_selection.load(Ordering::SeqCst) {
            return Err(SerialError::UserCancelledSelection);
        }
        Ok(Box::new(FakeDevice {
            descriptor: self.descriptor.clone(),
            counters: self.counters.clone(),
            fail_open: self.fail_open.load(Ordering::SeqCst),
            fail_writes: self.fail_writes.clone(),
            fail_close: self.fail_close.load(Ordering::SeqCst),
            peers_tx: self.peers_tx.clone(),
        }))
    }
}

struct FakeDevice {
    descriptor: DeviceDescriptor,
    counters: Arc<Counters>,
    fail_open: bool,
    fail_writes: Arc<AtomicBool>,
    fail_close: bool,
    peers_tx: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait::async_trait]
impl SerialDevice for FakeDevice {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    async fn open(&mut self, _baud_rate: u32) -> Result<SerialLink> {
        if self.fail_open {
            return Err(SerialError::OpenFailure("port is busy".to_string()));
        }
        let (host, device) = tokio::io::duplex(256);
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let _ = self.peers_tx.send(device);

        let (reader, writer) = tokio::io::split(host);
        Ok(SerialLink {
            reader: Box::new(reader),
            writer: Box::new(CountingWriter {
                inner: writer,
                counters: self.counters.clone(),
                fail: self.fail_writes.clone(),
            }),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(SerialError::TeardownFailure("device refused to close".to_string()));
        }
        Ok(())
    }
}

struct CountingWriter<W> {
    inner: W,
    counters: Arc<Counters>,
    fail: Arc<AtomicBool>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write rejected",
            )));
        }
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A reader that fails on the first read
pub struct BrokenReader;

impl AsyncRead for BrokenReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "device unplugged",
        )))
    }
}

/// Backend whose device reads fail immediately
pub struct BrokenReadBackend {
    pub counters: Arc<Counters>,
}

#[async_trait::async_trait]
impl SerialBackend for BrokenReadBackend {
    async fn is_available(&self) -> Result<()> {
        Ok(())
    }

    async fn request_port(&self) -> Result<Box<dyn SerialDevice>> {
        Ok(Box::new(BrokenReadDevice {
            counters: self.counters.clone(),
        }))
    }
}

struct BrokenReadDevice {
    counters: Arc<Counters>,
}

#[async_trait::async_trait]
impl SerialDevice for BrokenReadDevice {
    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::unknown("/dev/broken")
    }

    async fn open(&mut self, _baud_rate: u32) -> Result<SerialLink> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(SerialLink {
            reader: Box::new(BrokenReader),
            writer: Box::new(tokio::io::sink()),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Backend whose port selection never completes
pub struct HangingBackend;

#[async_trait::async_trait]
impl SerialBackend for HangingBackend {
    async fn is_available(&self) -> Result<()> {
        Ok(())
    }

    async fn request_port(&self) -> Result<Box<dyn SerialDevice>> {
        std::future::pending().await
    }
}

/// Poll `cond` until it holds or the deadline passes
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
