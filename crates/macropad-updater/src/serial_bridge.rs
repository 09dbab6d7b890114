// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of the FluxION Macropad Updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Serial monitor: one exclusive connection, a background line reader and a
//! command writer.
//!
//! At most one connection exists at a time. Opening a new port closes the
//! previous one first. A read or write failure tears the connection down and
//! notifies listeners exactly once with [`SerialEvent::Disconnected`].

use crate::error::{Result, UpdaterError};
use crate::macros::{MacroAssignment, MacroFormat};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 512;
const READ_CHUNK: usize = 512;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Byte streams of an opened port
pub struct SerialLink {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink").finish_non_exhaustive()
    }
}

/// Opens OS serial ports; replaced with in-memory links in tests
pub trait SerialOpener: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> Result<SerialLink>;
}

/// Opener backed by the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerialOpener;

struct PortIo(Box<dyn serialport::SerialPort>);

impl Read for PortIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PortIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl SerialOpener for SystemSerialOpener {
    fn open(&self, port: &str, baud: u32) -> Result<SerialLink> {
        let handle = serialport::new(port, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| UpdaterError::Serial(format!("failed to open {port}: {e}")))?;
        let reader = handle
            .try_clone()
            .map_err(|e| UpdaterError::Serial(format!("failed to clone {port}: {e}")))?;

        Ok(SerialLink {
            reader: Box::new(PortIo(reader)),
            writer: Box::new(PortIo(handle)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SerialEvent {
    /// One line of device output, line terminator stripped
    Line { port: String, text: String },
    /// The connection dropped on its own (unplug, read or write error)
    Disconnected { port: String, reason: String },
    /// The connection was closed on request
    Closed { port: String },
}

struct Connection {
    id: u64,
    port: String,
    writer: Box<dyn Write + Send>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

struct Shared {
    connection: Mutex<Option<Connection>>,
    events: broadcast::Sender<SerialEvent>,
}

impl Shared {
    /// Drop connection `id` if it is still current and tell listeners why
    fn teardown(&self, id: u64, reason: &str) {
        let dropped = {
            let mut slot = self.connection.lock();
            if slot.as_ref().is_some_and(|c| c.id == id) {
                slot.take()
            } else {
                None
            }
        };

        if let Some(connection) = dropped {
            connection.stop.store(true, Ordering::Release);
            tracing::warn!("Serial port {} disconnected: {reason}", connection.port);
            let _ = self.events.send(SerialEvent::Disconnected {
                port: connection.port,
                reason: reason.to_owned(),
            });
            // The reader thread may be the caller; it finishes on its own
        }
    }
}

pub struct SerialBridge {
    opener: Arc<dyn SerialOpener>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl fmt::Debug for SerialBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialBridge")
            .field("port", &self.port())
            .finish_non_exhaustive()
    }
}

impl Default for SerialBridge {
    fn default() -> Self {
        Self::new(Arc::new(SystemSerialOpener))
    }
}

impl SerialBridge {
    pub fn new(opener: Arc<dyn SerialOpener>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            opener,
            shared: Arc::new(Shared {
                connection: Mutex::new(None),
                events,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SerialEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.shared.connection.lock().is_some()
    }

    /// Port of the current connection
    pub fn port(&self) -> Option<String> {
        self.shared
            .connection
            .lock()
            .as_ref()
            .map(|c| c.port.clone())
    }

    /// Open `port`, closing any existing connection first
    pub fn open(&self, port: &str, baud: u32) -> Result<()> {
        let previous = self.shared.connection.lock().take();
        if let Some(previous) = previous {
            tracing::info!(
                "Closing serial port {} before opening {port}",
                previous.port
            );
            self.shutdown(previous);
        }

        let link = self.opener.open(port, baud)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));

        // Hold the slot while spawning so an instant EOF cannot race the insert
        let mut slot = self.shared.connection.lock();
        let reader = {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&stop);
            let port = port.to_owned();
            let stream = link.reader;
            std::thread::Builder::new()
                .name(format!("serial-{id}"))
                .spawn(move || read_lines(&shared, id, &port, stream, &stop))
                .map_err(|e| UpdaterError::Serial(format!("failed to start reader: {e}")))?
        };

        *slot = Some(Connection {
            id,
            port: port.to_owned(),
            writer: link.writer,
            stop,
            reader: Some(reader),
        });
        drop(slot);

        tracing::info!("Opened serial port {port} at {baud} baud");
        Ok(())
    }

    /// Close the current connection and release the port. No-op when closed.
    pub fn close(&self) {
        let current = self.shared.connection.lock().take();
        if let Some(connection) = current {
            self.shutdown(connection);
        }
    }

    fn shutdown(&self, mut connection: Connection) {
        let port = connection.port.clone();
        connection.stop.store(true, Ordering::Release);
        let reader = connection.reader.take();
        // Dropping the writer releases our half of the port
        drop(connection);
        if let Some(reader) = reader
            && reader.join().is_err()
        {
            tracing::warn!("Serial reader thread panicked");
        }
        tracing::info!("Closed serial port {port}");
        let _ = self.shared.events.send(SerialEvent::Closed { port });
    }

    /// Send one command line (a newline is appended)
    pub fn write_line(&self, line: &str) -> Result<()> {
        let (id, result) = {
            let mut slot = self.shared.connection.lock();
            let connection = slot.as_mut().ok_or(UpdaterError::NotOpen)?;
            let mut payload = Vec::with_capacity(line.len() + 1);
            payload.extend_from_slice(line.as_bytes());
            payload.push(b'\n');
            let result = connection
                .writer
                .write_all(&payload)
                .and_then(|()| connection.writer.flush());
            (connection.id, result)
        };

        match result {
            Ok(()) => {
                tracing::debug!("Serial command sent: {line}");
                Ok(())
            }
            Err(e) => {
                let reason = format!("write failed: {e}");
                self.shared.teardown(id, &reason);
                Err(UpdaterError::Serial(reason))
            }
        }
    }

    pub fn send_macros(&self, assignment: &MacroAssignment, format: MacroFormat) -> Result<()> {
        self.write_line(&assignment.to_command(format))
    }

    /// Send `command` and wait for the first line `accept` approves
    pub async fn query(
        &self,
        command: &str,
        timeout: Duration,
        accept: impl Fn(&str) -> bool + Send + Sync,
    ) -> Result<String> {
        let mut events = self.subscribe();
        self.write_line(command)?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(SerialEvent::Line { text, .. }) if accept(&text) => return Ok(text),
                    Ok(SerialEvent::Line { .. }) => {}
                    Ok(SerialEvent::Disconnected { reason, .. }) => {
                        return Err(UpdaterError::Serial(reason));
                    }
                    Ok(SerialEvent::Closed { .. }) => return Err(UpdaterError::NotOpen),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Serial query skipped {skipped} lines");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(UpdaterError::NotOpen),
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            UpdaterError::DeviceUnreachable(format!("no reply to {command:?} within {timeout:?}"))
        })?
    }
}

impl Drop for SerialBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_lines(
    shared: &Shared,
    id: u64,
    port: &str,
    mut stream: Box<dyn Read + Send>,
    stop: &AtomicBool,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }

        match stream.read(&mut chunk) {
            Ok(0) => {
                if !stop.load(Ordering::Acquire) {
                    shared.teardown(id, "port closed by device");
                }
                return;
            }
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&raw)
                        .trim_end_matches(['\r', '\n'])
                        .to_owned();
                    tracing::trace!("[{port}] {text}");
                    let _ = shared.events.send(SerialEvent::Line {
                        port: port.to_owned(),
                        text,
                    });
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    IoErrorKind::TimedOut | IoErrorKind::WouldBlock | IoErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    shared.teardown(id, &format!("read failed: {e}"));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Reader fed from a channel; times out like a real port when idle
    struct ChannelReader {
        rx: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(bytes) => self.pending = bytes,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        return Err(std::io::Error::new(IoErrorKind::TimedOut, "idle"));
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    /// Writer that records lines and answers `/version`
    struct EchoWriter {
        written: Arc<Mutex<Vec<u8>>>,
        reply: mpsc::Sender<Vec<u8>>,
        fail: bool,
    }

    impl Write for EchoWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.fail {
                return Err(std::io::Error::new(IoErrorKind::BrokenPipe, "unplugged"));
            }
            self.written.lock().extend_from_slice(buf);
            if buf.starts_with(b"/version") {
                let _ = self.reply.send(b"boot log line\r\n".to_vec());
                let _ = self.reply.send(b"3.1.5\r\n".to_vec());
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryOpener {
        written: Arc<Mutex<Vec<u8>>>,
        opened: Mutex<Vec<String>>,
        fail_writes: bool,
        greeting: Option<Vec<u8>>,
        hang_up: bool,
    }

    impl SerialOpener for MemoryOpener {
        fn open(&self, port: &str, _baud: u32) -> Result<SerialLink> {
            if port == "missing" {
                return Err(UpdaterError::Serial("no such port".to_owned()));
            }
            self.opened.lock().push(port.to_owned());
            let (tx, rx) = mpsc::channel();
            if let Some(greeting) = &self.greeting {
                tx.send(greeting.clone()).unwrap();
            }
            let writer_tx = if self.hang_up {
                // Dropping every sender makes the reader see EOF
                let (dead, _) = mpsc::channel();
                drop(tx);
                dead
            } else {
                tx
            };
            Ok(SerialLink {
                reader: Box::new(ChannelReader {
                    rx,
                    pending: Vec::new(),
                }),
                writer: Box::new(EchoWriter {
                    written: Arc::clone(&self.written),
                    reply: writer_tx,
                    fail: self.fail_writes,
                }),
            })
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<SerialEvent>) -> SerialEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lines_are_forwarded() {
        let opener = Arc::new(MemoryOpener {
            greeting: Some(b"Macropad ready\r\npartial".to_vec()),
            ..Default::default()
        });
        let bridge = SerialBridge::new(opener);
        let mut events = bridge.subscribe();

        bridge.open("COM5", 115_200).unwrap();
        assert!(bridge.is_open());
        assert_eq!(bridge.port().as_deref(), Some("COM5"));

        assert_eq!(
            next_event(&mut events).await,
            SerialEvent::Line {
                port: "COM5".to_owned(),
                text: "Macropad ready".to_owned()
            }
        );
        bridge.close();
    }

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let opener = Arc::new(MemoryOpener::default());
        let bridge = SerialBridge::new(opener.clone());
        bridge.open("COM5", 115_200).unwrap();

        bridge
            .send_macros(&MacroAssignment::new("CTRL+C", "WIN+L"), MacroFormat::Query)
            .unwrap();

        let written = String::from_utf8(opener.written.lock().clone()).unwrap();
        assert_eq!(written, "/set?m1=CTRL+C&m2=WIN+L\n");
        bridge.close();
    }

    #[test]
    fn test_write_when_closed_is_not_open() {
        let bridge = SerialBridge::new(Arc::new(MemoryOpener::default()));
        assert!(matches!(bridge.write_line("x"), Err(UpdaterError::NotOpen)));
    }

    #[tokio::test]
    async fn test_open_closes_previous_connection() {
        let opener = Arc::new(MemoryOpener::default());
        let bridge = SerialBridge::new(opener.clone());
        let mut events = bridge.subscribe();

        bridge.open("COM5", 115_200).unwrap();
        bridge.open("COM7", 115_200).unwrap();

        assert_eq!(
            next_event(&mut events).await,
            SerialEvent::Closed {
                port: "COM5".to_owned()
            }
        );
        assert_eq!(bridge.port().as_deref(), Some("COM7"));
        assert_eq!(*opener.opened.lock(), vec!["COM5", "COM7"]);
        bridge.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bridge = SerialBridge::new(Arc::new(MemoryOpener::default()));
        bridge.open("COM5", 115_200).unwrap();
        bridge.close();
        bridge.close();
        assert!(!bridge.is_open());
        assert!(bridge.port().is_none());
    }

    #[tokio::test]
    async fn test_device_hangup_notifies_once() {
        let opener = Arc::new(MemoryOpener {
            hang_up: true,
            ..Default::default()
        });
        let bridge = SerialBridge::new(opener);
        let mut events = bridge.subscribe();
        bridge.open("COM5", 115_200).unwrap();

        let event = next_event(&mut events).await;
        assert!(matches!(event, SerialEvent::Disconnected { ref port, .. } if port == "COM5"));
        assert!(!bridge.is_open());

        // Nothing else follows, and close stays quiet
        bridge.close();
        let extra = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_write_failure_tears_down() {
        let opener = Arc::new(MemoryOpener {
            fail_writes: true,
            ..Default::default()
        });
        let bridge = SerialBridge::new(opener);
        let mut events = bridge.subscribe();
        bridge.open("COM5", 115_200).unwrap();

        let err = bridge.write_line("/version").unwrap_err();
        assert!(matches!(err, UpdaterError::Serial(_)));
        assert!(!bridge.is_open());
        assert!(matches!(
            next_event(&mut events).await,
            SerialEvent::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_query_returns_accepted_line() {
        let bridge = SerialBridge::new(Arc::new(MemoryOpener::default()));
        bridge.open("COM5", 115_200).unwrap();

        let reply = bridge
            .query("/version", Duration::from_secs(2), |line| {
                line.chars().next().is_some_and(|c| c.is_ascii_digit())
            })
            .await
            .unwrap();
        assert_eq!(reply, "3.1.5");
        bridge.close();
    }

    #[tokio::test]
    async fn test_query_times_out() {
        let bridge = SerialBridge::new(Arc::new(MemoryOpener::default()));
        bridge.open("COM5", 115_200).unwrap();

        let err = bridge
            .query("/nothing", Duration::from_millis(50), |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdaterError::DeviceUnreachable(_)));
        bridge.close();
    }

    #[test]
    fn test_open_failure_leaves_bridge_closed() {
        let bridge = SerialBridge::new(Arc::new(MemoryOpener::default()));
        assert!(matches!(
            bridge.open("missing", 115_200),
            Err(UpdaterError::Serial(_))
        ));
        assert!(!bridge.is_open());
    }
}
