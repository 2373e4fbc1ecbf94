//! Transport seam: how the engine reaches a PCI.
//!
//! A [`Connector`] dials the endpoint and yields a [`Link`]; the link owns a
//! reader thread that forwards raw byte chunks (and eventually a close
//! notification) over a channel, so the engine can multiplex transport
//! traffic with its inbox and timers in one `select!`. Writes happen
//! directly on the caller's thread; at 9600 baud they are small and rare.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

/// Poll granularity for the reader thread's stop flag.
const READ_POLL: Duration = Duration::from_millis(200);

/// Something the reader thread observed.
#[derive(Debug)]
pub enum LinkEvent {
    Data(Vec<u8>),
    Closed { error: Option<String> },
}

/// An open bidirectional byte channel to the PCI.
pub trait Link: Send {
    /// Write the whole buffer to the transport.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Take the receive side. Yields `None` after the first call.
    fn take_events(&mut self) -> Option<Receiver<LinkEvent>>;

    /// Tear the connection down and stop the reader thread. Idempotent.
    fn close(&mut self);
}

/// Dials a PCI endpoint.
pub trait Connector: Send {
    fn connect(&mut self) -> io::Result<Box<dyn Link>>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Spawn the shared reader loop over any cloneable reader half.
fn spawn_reader<R>(mut reader: R, stop: Arc<AtomicBool>) -> Receiver<LinkEvent>
where
    R: Read + Send + 'static,
{
    let (tx, rx): (Sender<LinkEvent>, Receiver<LinkEvent>) = crossbeam::channel::unbounded();
    thread::Builder::new()
        .name("pci-read".into())
        .spawn(move || {
            let mut buf = [0u8; 512];
            loop {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                match reader.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(LinkEvent::Closed { error: None });
                        return;
                    }
                    Ok(n) => {
                        if tx.send(LinkEvent::Data(buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let _ = tx.send(LinkEvent::Closed {
                            error: Some(err.to_string()),
                        });
                        return;
                    }
                }
            }
        })
        .expect("spawn pci reader thread");
    rx
}

/// TCP transport for CNIs and networked PCIs.
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> io::Result<Box<dyn Link>> {
        let resolved: Vec<SocketAddr> = self.addr.to_socket_addrs()?.collect();
        let Some(addr) = resolved.first() else {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} resolved to no addresses", self.addr),
            ));
        };
        let stream = TcpStream::connect_timeout(addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;

        let reader = stream.try_clone()?;
        reader.set_read_timeout(Some(READ_POLL))?;
        let stop = Arc::new(AtomicBool::new(false));
        let events = spawn_reader(reader, Arc::clone(&stop));

        Ok(Box::new(TcpLink {
            stream,
            events: Some(events),
            stop,
        }))
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

struct TcpLink {
    stream: TcpStream,
    events: Option<Receiver<LinkEvent>>,
    stop: Arc<AtomicBool>,
}

impl Link for TcpLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    fn take_events(&mut self) -> Option<Receiver<LinkEvent>> {
        self.events.take()
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serial transport for directly attached PCIs (9600 8N1).
#[cfg(feature = "serial")]
pub struct SerialConnector {
    device: String,
    baud_rate: u32,
}

#[cfg(feature = "serial")]
impl SerialConnector {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: 9600,
        }
    }
}

#[cfg(feature = "serial")]
impl Connector for SerialConnector {
    fn connect(&mut self) -> io::Result<Box<dyn Link>> {
        let port = serialport::new(&self.device, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_POLL)
            .open()
            .map_err(io::Error::other)?;

        let reader = port.try_clone().map_err(io::Error::other)?;
        let stop = Arc::new(AtomicBool::new(false));
        let events = spawn_reader(reader, Arc::clone(&stop));

        Ok(Box::new(SerialLink {
            port,
            events: Some(events),
            stop,
        }))
    }

    fn endpoint(&self) -> String {
        format!("serial://{}", self.device)
    }
}

#[cfg(feature = "serial")]
struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
    events: Option<Receiver<LinkEvent>>,
    stop: Arc<AtomicBool>,
}

#[cfg(feature = "serial")]
impl Link for SerialLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn take_events(&mut self) -> Option<Receiver<LinkEvent>> {
        self.events.take()
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_link_round_trips_bytes_and_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = conn.read(&mut buf).unwrap();
            conn.write_all(&buf[..n]).unwrap();
            // Dropping the socket ends the stream.
        });

        let mut connector = TcpConnector::new(addr.to_string());
        let mut link = connector.connect().unwrap();
        let events = link.take_events().unwrap();
        assert!(link.take_events().is_none());

        link.write_all(b"~~~").unwrap();
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            LinkEvent::Data(data) => assert_eq!(data, b"~~~"),
            other => panic!("expected data, got {other:?}"),
        }
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            LinkEvent::Closed { error } => assert!(error.is_none()),
            other => panic!("expected close, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn connect_failure_surfaces_as_io_error() {
        // Port 1 on localhost is essentially never listening.
        let mut connector = TcpConnector::new("127.0.0.1:1");
        assert!(connector.connect().is_err());
    }
}
