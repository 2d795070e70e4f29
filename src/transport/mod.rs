//! # Transport
//!
//! A [`Link`] is an open duplex byte channel to one radio. Inbound bytes are delivered to the
//! link's event channel as [`LinkEvent::Bytes`] exactly as they were read (no framing), and
//! the end of the link is delivered once as [`LinkEvent::Closed`]. Writes go through a
//! bounded queue drained by a writer task; a full queue is reported as backpressure rather
//! than blocking the caller.
//!
//! Targets:
//! - serial ports through the `serialport` crate (feature `serial`), with blocking reader and
//!   writer threads,
//! - TCP (`host:port`, default port 4403) through tokio,
//! - any `AsyncRead + AsyncWrite` stream via [`Link::from_stream`].
//!
//! The transport never reconnects on its own.

use std::fmt;
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::TransportError;
use crate::logutil::hex_snippet;

/// Default TCP port of the Meshtastic network API
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// Identity of one connection: the serial port name or the network `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionHandle(String);

impl ConnectionHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportTarget {
    Serial {
        port: String,
        baud: u32,
        dtr: bool,
        rts: bool,
    },
    Tcp {
        address: String,
    },
}

impl TransportTarget {
    /// Interpret a user-supplied target: `tcp://host[:port]` or anything containing a colon
    /// that is not a Windows drive path is TCP, the rest is a serial port name.
    pub fn parse(target: &str, baud: u32, dtr: bool, rts: bool) -> Self {
        if let Some(addr) = target.strip_prefix("tcp://") {
            return TransportTarget::Tcp {
                address: with_default_port(addr),
            };
        }
        let looks_like_host = target.contains(':') && !target.contains('\\') && !target.starts_with('/');
        if looks_like_host {
            TransportTarget::Tcp {
                address: with_default_port(target),
            }
        } else {
            TransportTarget::Serial {
                port: target.to_string(),
                baud,
                dtr,
                rts,
            }
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        match self {
            TransportTarget::Serial { port, .. } => ConnectionHandle::new(port.clone()),
            TransportTarget::Tcp { address } => ConnectionHandle::new(with_default_port(address)),
        }
    }
}

fn with_default_port(addr: &str) -> String {
    let has_port = addr
        .rsplit_once(':')
        .map(|(_, p)| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr.trim_end_matches(':'), DEFAULT_TCP_PORT)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Bytes(Vec<u8>),
    /// Terminal; nothing follows
    Closed(TransportError),
}

/// Sizes of the link's queues
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub outbound_queue: usize,
    pub inbound_queue: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            outbound_queue: 64,
            inbound_queue: 256,
        }
    }
}

enum Workers {
    Tasks(Vec<JoinHandle<()>>),
    #[cfg(feature = "serial")]
    Threads(std::sync::Arc<std::sync::atomic::AtomicBool>),
}

pub struct Link {
    handle: ConnectionHandle,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    workers: Option<Workers>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("handle", &self.handle)
            .field("open", &self.tx.is_some())
            .finish()
    }
}

impl Link {
    /// Open a link to `target`, bounded by `open_timeout`.
    pub async fn open(
        target: &TransportTarget,
        open_timeout: Duration,
        options: LinkOptions,
    ) -> Result<(Link, mpsc::Receiver<LinkEvent>), TransportError> {
        match target {
            TransportTarget::Tcp { address } => {
                let address = with_default_port(address);
                debug!("Connecting TCP {}", address);
                let stream = tokio::time::timeout(open_timeout, tokio::net::TcpStream::connect(&address))
                    .await
                    .map_err(|_| TransportError::OpenTimeout(address.clone()))?
                    .map_err(|e| TransportError::OpenFailed {
                        target: address.clone(),
                        reason: e.to_string(),
                    })?;
                let _ = stream.set_nodelay(true);
                info!("TCP link open to {}", address);
                Ok(Link::from_stream(ConnectionHandle::new(address), stream, options))
            }
            #[cfg(feature = "serial")]
            TransportTarget::Serial { port, baud, dtr, rts } => {
                serial::open(port, *baud, *dtr, *rts, open_timeout, options).await
            }
            #[cfg(not(feature = "serial"))]
            TransportTarget::Serial { port, .. } => Err(TransportError::OpenFailed {
                target: port.clone(),
                reason: "built without the 'serial' feature".to_string(),
            }),
        }
    }

    /// Wrap an already connected async stream.
    pub fn from_stream<S>(
        handle: ConnectionHandle,
        stream: S,
        options: LinkOptions,
    ) -> (Link, mpsc::Receiver<LinkEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::channel(options.inbound_queue);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(options.outbound_queue);

        let read_events = event_tx.clone();
        let read_handle = handle.clone();
        let reader_task = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        debug!("{}: end of stream", read_handle);
                        let _ = read_events
                            .send(LinkEvent::Closed(TransportError::Unplugged("end of stream".into())))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        if read_events.send(LinkEvent::Bytes(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("{}: read error: {}", read_handle, e);
                        let _ = read_events
                            .send(LinkEvent::Closed(TransportError::Unplugged(e.to_string())))
                            .await;
                        break;
                    }
                }
            }
        });

        let write_handle = handle.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                trace!("{}: TX {}", write_handle, hex_snippet(&bytes, 64));
                let res = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = res {
                    warn!("{}: write error: {}", write_handle, e);
                    let _ = event_tx
                        .send(LinkEvent::Closed(TransportError::WriteFailed(e.to_string())))
                        .await;
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let link = Link {
            handle,
            tx: Some(out_tx),
            workers: Some(Workers::Tasks(vec![reader_task, writer_task])),
        };
        (link, event_rx)
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn is_open(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    /// Queue bytes for writing.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::WriteFailed("link closed".into()))?;
        tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::WriteFailed("writer stopped".into()),
        })
    }

    /// Release the link. Safe to call more than once.
    pub fn close(&mut self) {
        let was_open = self.tx.take().is_some();
        match self.workers.take() {
            Some(Workers::Tasks(tasks)) => {
                // Writer exits once the queue sender is gone; the reader would block on the
                // stream forever, so it is aborted.
                if let Some(reader) = tasks.first() {
                    reader.abort();
                }
            }
            #[cfg(feature = "serial")]
            Some(Workers::Threads(stop)) => {
                stop.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            None => {}
        }
        if was_open {
            debug!("{}: link closed", self.handle);
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

/// Names of serial ports present on this machine
pub fn list_serial_ports() -> Result<Vec<String>, TransportError> {
    #[cfg(feature = "serial")]
    {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .map_err(|e| TransportError::OpenFailed {
                target: "serial enumeration".into(),
                reason: e.to_string(),
            })
    }
    #[cfg(not(feature = "serial"))]
    {
        Ok(Vec::new())
    }
}

#[cfg(feature = "serial")]
mod serial {
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use log::{debug, info, warn};
    use tokio::sync::mpsc;

    use super::{ConnectionHandle, Link, LinkEvent, LinkOptions, Workers};
    use crate::errors::TransportError;

    pub(super) async fn open(
        port_name: &str,
        baud: u32,
        dtr: bool,
        rts: bool,
        open_timeout: Duration,
        options: LinkOptions,
    ) -> Result<(Link, mpsc::Receiver<LinkEvent>), TransportError> {
        debug!("Opening serial port {} at {} baud", port_name, baud);
        let name = port_name.to_string();
        let opening = tokio::task::spawn_blocking(move || {
            let mut builder = serialport::new(&name, baud).timeout(Duration::from_millis(100));
            #[cfg(unix)]
            {
                builder = builder
                    .data_bits(serialport::DataBits::Eight)
                    .stop_bits(serialport::StopBits::One)
                    .parity(serialport::Parity::None);
            }
            let mut port = builder.open()?;
            port.write_data_terminal_ready(dtr)?;
            port.write_request_to_send(rts)?;
            Ok::<_, serialport::Error>(port)
        });
        let open_failed = |reason: String| TransportError::OpenFailed {
            target: port_name.to_string(),
            reason,
        };
        let port = tokio::time::timeout(open_timeout, opening)
            .await
            .map_err(|_| TransportError::OpenTimeout(port_name.to_string()))?
            .map_err(|e| open_failed(e.to_string()))?
            .map_err(|e| open_failed(e.to_string()))?;
        let mut writer_port = port.try_clone().map_err(|e| open_failed(e.to_string()))?;
        let mut reader_port = port;

        let handle = ConnectionHandle::new(port_name);
        let stop = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::channel(options.inbound_queue);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(options.outbound_queue);

        let read_stop = stop.clone();
        let read_events = event_tx.clone();
        let read_name = port_name.to_string();
        std::thread::Builder::new()
            .name(format!("serial-rx {}", port_name))
            .spawn(move || {
                let mut buf = [0u8; 1024];
                while !read_stop.load(Ordering::SeqCst) {
                    match reader_port.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            if read_events.blocking_send(LinkEvent::Bytes(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("{}: serial read failed: {}", read_name, e);
                            let _ = read_events
                                .blocking_send(LinkEvent::Closed(TransportError::Unplugged(e.to_string())));
                            break;
                        }
                    }
                }
                debug!("{}: serial reader stopped", read_name);
            })
            .map_err(|e| open_failed(e.to_string()))?;

        let write_name = port_name.to_string();
        std::thread::Builder::new()
            .name(format!("serial-tx {}", port_name))
            .spawn(move || {
                while let Some(bytes) = out_rx.blocking_recv() {
                    let res = writer_port.write_all(&bytes).and_then(|_| writer_port.flush());
                    if let Err(e) = res {
                        warn!("{}: serial write failed: {}", write_name, e);
                        let _ = event_tx.blocking_send(LinkEvent::Closed(TransportError::WriteFailed(e.to_string())));
                        break;
                    }
                }
            })
            .map_err(|e| open_failed(e.to_string()))?;

        info!("Serial link open on {} @ {} baud", port_name, baud);
        let link = Link {
            handle,
            tx: Some(out_tx),
            workers: Some(Workers::Threads(stop)),
        };
        Ok((link, event_rx))
    }
}
