use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// Largest response line accepted from the adapter
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Quiet period that ends the discard of a late response
const DRAIN_QUIET: Duration = Duration::from_millis(20);

/// Default TCP port of Prologix-style GPIB-Ethernet adapters
pub const DEFAULT_ADAPTER_PORT: u16 = 1234;

/// Default GPIB primary address of the analyzer
pub const DEFAULT_GPIB_ADDRESS: u8 = 17;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bus call timed out")]
    Timeout,
    #[error("link closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    fn classify(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout,
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io(error),
        }
    }
}

/// Where the analyzer lives: the adapter's network endpoint plus the
/// instrument's GPIB primary address behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusAddress {
    pub host: String,
    pub port: u16,
    pub gpib_address: u8,
}

impl Default for BusAddress {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_ADAPTER_PORT,
            gpib_address: DEFAULT_GPIB_ADDRESS,
        }
    }
}

impl std::fmt::Display for BusAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}::GPIB{}", self.host, self.port, self.gpib_address)
    }
}

/// Synchronous request/response link to the instrument.
///
/// Implementations block for at most their configured timeout per call.
/// The engine's worker thread is the only caller.
pub trait BusTransport: Send {
    fn connect(&mut self, address: &BusAddress) -> Result<(), TransportError>;

    fn write(&mut self, command: &str) -> Result<(), TransportError>;

    fn query(&mut self, command: &str) -> Result<String, TransportError>;

    /// Release the link. Called on disconnect and after fatal bus errors.
    fn close(&mut self) {}
}

/// Timeouts for the adapter's TCP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Bounded wait for each query response
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder for [`PrologixTransport`].
///
/// ```
/// use std::time::Duration;
/// use rusty_sweep::PrologixTransport;
///
/// let transport = PrologixTransport::builder()
///     .read_timeout(Duration::from_secs(10))
///     .build();
/// ```
#[derive(Default)]
pub struct PrologixTransportBuilder {
    config: ConnectionConfig,
}

impl PrologixTransportBuilder {
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn build(self) -> PrologixTransport {
        PrologixTransport {
            config: self.config,
            stream: None,
            reader: None,
            reply_pending: false,
        }
    }
}

/// GPIB access through a Prologix-style GPIB-Ethernet adapter.
///
/// The adapter is put into controller mode with auto-read disabled, so
/// plain writes never make the instrument talk. Queries are followed by
/// `++read eoi` and the response is read up to the line terminator.
///
/// A response that times out may still arrive later. It is discarded
/// before the next command goes out so it cannot answer a later query.
pub struct PrologixTransport {
    config: ConnectionConfig,
    stream: Option<TcpStream>,
    reader: Option<BufReader<TcpStream>>,
    /// A query timed out and its response has not been seen yet
    reply_pending: bool,
}

impl PrologixTransport {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> PrologixTransportBuilder {
        PrologixTransportBuilder::default()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        debug!("-> {line}");
        stream
            .write_all(format!("{line}\r\n").as_bytes())
            .and_then(|_| stream.flush())
            .map_err(TransportError::classify)
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        let mut line = String::new();
        let read = match reader
            .by_ref()
            .take(MAX_RESPONSE_SIZE as u64)
            .read_line(&mut line)
            .map_err(TransportError::classify)
        {
            Ok(read) => read,
            Err(TransportError::Timeout) => {
                self.reply_pending = true;
                return Err(TransportError::Timeout);
            }
            Err(e) => return Err(e),
        };

        if read == 0 {
            return Err(TransportError::Closed);
        }
        if !line.ends_with('\n') && read >= MAX_RESPONSE_SIZE {
            return Err(TransportError::Io(std::io::Error::other(format!(
                "response exceeds {MAX_RESPONSE_SIZE} bytes"
            ))));
        }
        debug!("<- {} bytes", line.len());
        Ok(line.trim_end().to_string())
    }

    /// Throw away the response of a query that timed out.
    ///
    /// Waits up to two read timeouts for its line terminator, then reads
    /// until the link stays quiet for `DRAIN_QUIET`.
    fn discard_late_reply(&mut self) -> Result<(), TransportError> {
        if !self.reply_pending {
            return Ok(());
        }
        let stream = self.stream.as_ref().ok_or(TransportError::Closed)?;
        let mut raw = stream.try_clone()?;
        // Bytes of the partial response may sit in the old buffer
        self.reader = Some(BufReader::new(stream.try_clone()?));

        let mut scratch = [0u8; 4096];
        let mut discarded = 0usize;
        let mut terminated = false;
        let result = loop {
            let wait = if terminated {
                DRAIN_QUIET
            } else {
                self.config.read_timeout * 2
            };
            if let Err(e) = raw.set_read_timeout(Some(wait)) {
                break Err(TransportError::Io(e));
            }
            match raw.read(&mut scratch) {
                Ok(0) => break Err(TransportError::Closed),
                Ok(n) => {
                    discarded += n;
                    terminated |= scratch[..n].contains(&b'\n');
                }
                Err(e) => match TransportError::classify(e) {
                    TransportError::Timeout => break Ok(()),
                    other => break Err(other),
                },
            }
        };
        raw.set_read_timeout(Some(self.config.read_timeout))?;

        self.reply_pending = false;
        if discarded > 0 {
            warn!("Discarded {discarded} bytes of a late response");
        }
        result
    }
}

impl Default for PrologixTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BusTransport for PrologixTransport {
    fn connect(&mut self, address: &BusAddress) -> Result<(), TransportError> {
        self.close();

        let socket_addr = (address.host.as_str(), address.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("cannot resolve {}", address.host),
                ))
            })?;

        debug!("Connecting to GPIB adapter at {socket_addr}");
        let stream = TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout)
            .map_err(|e| {
                warn!("Failed to connect to {address}: {e}");
                TransportError::classify(e)
            })?;
        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        stream.set_nodelay(true)?;

        self.reader = Some(BufReader::new(stream.try_clone()?));
        self.stream = Some(stream);

        let read_tmo_ms = self.config.read_timeout.as_millis().clamp(1, 3000);
        self.send_line("++mode 1")?;
        self.send_line(&format!("++addr {}", address.gpib_address))?;
        self.send_line("++auto 0")?;
        self.send_line("++eoi 1")?;
        self.send_line("++eos 0")?;
        self.send_line(&format!("++read_tmo_ms {read_tmo_ms}"))?;

        debug!("GPIB adapter configured for {address}");
        Ok(())
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.discard_late_reply()?;
        self.send_line(command)
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.discard_late_reply()?;
        self.send_line(command)?;
        self.send_line("++read eoi")?;
        self.read_line()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.reader = None;
        self.reply_pending = false;
    }
}

impl Drop for PrologixTransport {
    fn drop(&mut self) {
        self.close();
    }
}
