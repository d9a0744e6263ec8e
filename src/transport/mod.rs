//! RFB-TV connection worker: TCP/TLS client socket plus the receive
//! thread that turns socket reads into session events.

use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use std::error::Error;
use std::fmt;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RECEIVE_CHUNK_SIZE: usize = 4096;

/// Poll interval for the receive loop; bounds how long a close can take.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Transport-level errors as classified for the reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    ConnectionRefused,
    HostNotFound,
    ConnectTimeout,
    ReadError,
    /// The socket was closed on purpose; exit silently.
    ThreadShutdown,
    /// Trying to send data while the connection is not open.
    ConnectionNotOpen,
    Tls(String),
    WriteError,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionRefused => write!(f, "Connection refused"),
            TransportError::HostNotFound => write!(f, "Host not found"),
            TransportError::ConnectTimeout => write!(f, "Connect timeout"),
            TransportError::ReadError => write!(f, "Socket read error"),
            TransportError::ThreadShutdown => write!(f, "Receive thread shut down"),
            TransportError::ConnectionNotOpen => {
                write!(f, "Trying to send data while the connection is not open")
            }
            TransportError::Tls(msg) => write!(f, "TLS error: {}", msg),
            TransportError::WriteError => write!(f, "Socket write error"),
        }
    }
}

impl Error for TransportError {}

/// Receiver of raw connection output. Buffer ownership moves with the
/// call so handling can be deferred without copying.
pub trait StreamSink: Send + Sync {
    fn stream_data(&self, data: Bytes);
    /// `Ok(())` reports a regular remote close.
    fn stream_error(&self, result: Result<(), TransportError>);
}

enum SocketKind {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(native_tls::TlsStream<TcpStream>),
}

impl SocketKind {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            SocketKind::Plain(stream) => stream.write_all(data),
            #[cfg(feature = "tls")]
            SocketKind::Tls(stream) => stream.write_all(data),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            SocketKind::Plain(stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            SocketKind::Tls(stream) => stream.read(buf),
        }
    }
}

struct Shared {
    socket: Option<SocketKind>,
    /// Raw handle kept for interrupting a blocking read on close.
    raw: Option<TcpStream>,
}

/// Owns the socket and its receive thread. Not reentrant: `open` must be
/// paired with `close` before the next `open`.
pub struct ConnectionWorker {
    shared: Arc<Mutex<Shared>>,
    shutting_down: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Default for ConnectionWorker {
    fn default() -> Self {
        ConnectionWorker {
            shared: Arc::new(Mutex::new(Shared {
                socket: None,
                raw: None,
            })),
            shutting_down: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl ConnectionWorker {
    pub fn new() -> Self {
        ConnectionWorker::default()
    }

    /// Open a connection and start the receive thread. The connect itself
    /// happens on that thread; failures arrive through the sink.
    pub fn open(
        &mut self,
        host: &str,
        port: u16,
        use_tls: bool,
        sink: Arc<dyn StreamSink>,
    ) -> Result<(), TransportError> {
        debug_assert!(self.thread.is_none(), "reopen without close");

        self.shutting_down.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let shutting_down = self.shutting_down.clone();
        let host = host.to_string();

        let thread = thread::Builder::new()
            .name("rfbtv-receive".to_string())
            .spawn(move || receive_loop(shared, shutting_down, host, port, use_tls, sink))
            .map_err(|_| TransportError::ConnectionNotOpen)?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Stop the receive thread and close the socket. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        {
            let mut shared = self.shared.lock();
            if let Some(raw) = shared.raw.take() {
                let _ = raw.shutdown(Shutdown::Both);
            }
            shared.socket = None;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!("Connection closed");
    }

    /// Synchronous write; callable only from the kernel thread.
    pub fn send_data(&self, data: &[u8]) -> Result<(), TransportError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut shared = self.shared.lock();
        match &mut shared.socket {
            Some(socket) => socket.write_all(data).map_err(|e| {
                error!("Socket write failed: {}", e);
                TransportError::WriteError
            }),
            None => Err(TransportError::ConnectionNotOpen),
        }
    }
}

impl Drop for ConnectionWorker {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify_connect_error(error: &std::io::Error) -> TransportError {
    match error.kind() {
        std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
        std::io::ErrorKind::TimedOut => TransportError::ConnectTimeout,
        _ => TransportError::ConnectionRefused,
    }
}

fn receive_loop(
    shared: Arc<Mutex<Shared>>,
    shutting_down: Arc<AtomicBool>,
    host: String,
    port: u16,
    use_tls: bool,
    sink: Arc<dyn StreamSink>,
) {
    // Resolve and connect; name resolution failure is terminal for the
    // reconnect policy
    let addrs: Vec<_> = match (host.as_str(), port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(_) => {
            warn!("Cannot resolve {}", host);
            sink.stream_error(Err(TransportError::HostNotFound));
            return;
        }
    };
    if addrs.is_empty() {
        sink.stream_error(Err(TransportError::HostNotFound));
        return;
    }

    let mut stream = None;
    let mut last_error = TransportError::ConnectionRefused;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(error) => last_error = classify_connect_error(&error),
        }
    }
    let stream = match stream {
        Some(stream) => stream,
        None => {
            if shutting_down.load(Ordering::SeqCst) {
                sink.stream_error(Err(TransportError::ThreadShutdown));
            } else {
                sink.stream_error(Err(last_error));
            }
            return;
        }
    };

    info!(
        "Connected to {}:{}{}",
        host,
        port,
        if use_tls { " (TLS)" } else { "" }
    );
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
    let raw = match stream.try_clone() {
        Ok(raw) => raw,
        Err(_) => {
            sink.stream_error(Err(TransportError::ReadError));
            return;
        }
    };

    let socket = if use_tls {
        #[cfg(feature = "tls")]
        {
            let connector = match native_tls::TlsConnector::new() {
                Ok(connector) => connector,
                Err(error) => {
                    sink.stream_error(Err(TransportError::Tls(error.to_string())));
                    return;
                }
            };
            match connector.connect(&host, stream) {
                Ok(tls) => SocketKind::Tls(tls),
                Err(error) => {
                    sink.stream_error(Err(TransportError::Tls(error.to_string())));
                    return;
                }
            }
        }
        #[cfg(not(feature = "tls"))]
        {
            sink.stream_error(Err(TransportError::Tls(
                "TLS support not compiled in".to_string(),
            )));
            return;
        }
    } else {
        SocketKind::Plain(stream)
    };

    {
        let mut guard = shared.lock();
        guard.raw = Some(raw);
        guard.socket = Some(socket);
    }

    let mut buffer = vec![0u8; RECEIVE_CHUNK_SIZE];
    loop {
        if shutting_down.load(Ordering::SeqCst) {
            sink.stream_error(Err(TransportError::ThreadShutdown));
            return;
        }

        // Hold the lock only for the bounded read so sends interleave
        let result = {
            let mut guard = shared.lock();
            match &mut guard.socket {
                Some(socket) => socket.read(&mut buffer),
                None => {
                    sink.stream_error(Err(TransportError::ThreadShutdown));
                    return;
                }
            }
        };

        match result {
            Ok(0) => {
                debug!("Remote closed the connection");
                sink.stream_error(Ok(()));
                return;
            }
            Ok(n) => sink.stream_data(Bytes::copy_from_slice(&buffer[..n])),
            Err(error)
                if error.kind() == std::io::ErrorKind::WouldBlock
                    || error.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => {
                if shutting_down.load(Ordering::SeqCst) {
                    sink.stream_error(Err(TransportError::ThreadShutdown));
                } else {
                    sink.stream_error(Err(TransportError::ReadError));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{unbounded, Sender};
    use std::net::TcpListener;

    struct ChannelSink {
        data: Sender<Bytes>,
        errors: Sender<Result<(), TransportError>>,
    }

    impl StreamSink for ChannelSink {
        fn stream_data(&self, data: Bytes) {
            let _ = self.data.send(data);
        }
        fn stream_error(&self, result: Result<(), TransportError>) {
            let _ = self.errors.send(result);
        }
    }

    #[test]
    fn receives_data_and_clean_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(b"RFB-TV 002.000\n").unwrap();
            // Read the echoed version back
            let mut buf = [0u8; 15];
            socket.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"RFB-TV 002.000\n");
        });

        let (data_tx, data_rx) = unbounded();
        let (err_tx, err_rx) = unbounded();
        let mut worker = ConnectionWorker::new();
        worker
            .open(
                "127.0.0.1",
                port,
                false,
                Arc::new(ChannelSink {
                    data: data_tx,
                    errors: err_tx,
                }),
            )
            .unwrap();

        let received = data_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&received[..], b"RFB-TV 002.000\n");

        worker.send_data(b"RFB-TV 002.000\n").unwrap();
        server.join().unwrap();

        // Server side closes: a clean close arrives as Ok
        let result = err_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Ok(()));

        worker.close();
    }

    #[test]
    fn refused_connection_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener); // Nothing listens on the port now

        let (data_tx, _data_rx) = unbounded();
        let (err_tx, err_rx) = unbounded();
        let mut worker = ConnectionWorker::new();
        worker
            .open(
                "127.0.0.1",
                port,
                false,
                Arc::new(ChannelSink {
                    data: data_tx,
                    errors: err_tx,
                }),
            )
            .unwrap();

        let result = err_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Err(TransportError::ConnectionRefused));
        worker.close();
    }

    #[test]
    fn send_without_open_fails() {
        let worker = ConnectionWorker::new();
        assert_eq!(
            worker.send_data(b"x"),
            Err(TransportError::ConnectionNotOpen)
        );
    }

    #[test]
    fn close_interrupts_receive_thread() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let keep_open = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(500));
            drop(socket);
        });

        let (data_tx, _data_rx) = unbounded();
        let (err_tx, err_rx) = unbounded();
        let mut worker = ConnectionWorker::new();
        worker
            .open(
                "127.0.0.1",
                port,
                false,
                Arc::new(ChannelSink {
                    data: data_tx,
                    errors: err_tx,
                }),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        worker.close();

        let result = err_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Err(TransportError::ThreadShutdown));
        keep_open.join().unwrap();
    }
}
