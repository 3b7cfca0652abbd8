use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::Operation;
use crate::error::{EngineError, ErrorKind};
use crate::hp4195a::{BusAddress, BusTransport, Protocol, Query, SetCommand, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(Activity),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

/// Thresholds after which bus trouble is treated as unrecoverable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusLimits {
    pub max_consecutive_timeouts: usize,
    pub max_consecutive_io_failures: usize,
}

impl Default for BusLimits {
    fn default() -> Self {
        Self {
            max_consecutive_timeouts: 3,
            max_consecutive_io_failures: 2,
        }
    }
}

/// Caller-side snapshot of the instrument session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub address: BusAddress,
    pub connected: bool,
    pub last_error: Option<ErrorKind>,
    pub identity: Option<String>,
}

struct GateState {
    connection: ConnectionState,
    running: Option<Operation>,
    info: SessionInfo,
}

/// Single-operation lock shared between the caller and the worker.
///
/// Acceptance and release are each one critical section, so a request is
/// either accepted exactly once or rejected, never both.
pub(crate) struct SessionGate {
    state: Mutex<GateState>,
}

impl SessionGate {
    pub(crate) fn new(address: BusAddress) -> Self {
        Self {
            state: Mutex::new(GateState {
                connection: ConnectionState::Disconnected,
                running: None,
                info: SessionInfo {
                    address,
                    connected: false,
                    last_error: None,
                    identity: None,
                },
            }),
        }
    }

    /// Claim the instrument for `operation` or explain why not
    pub(crate) fn try_accept(&self, operation: Operation) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        match state.connection {
            ConnectionState::Connecting | ConnectionState::Connected(Activity::Busy) => {
                let running = state
                    .running
                    .map(|op| op.to_string())
                    .unwrap_or_else(|| Operation::Connect.to_string());
                Err(EngineError::Busy { running })
            }
            ConnectionState::Disconnected if operation == Operation::Connect => {
                state.connection = ConnectionState::Connecting;
                state.running = Some(operation);
                Ok(())
            }
            ConnectionState::Disconnected => {
                Err(EngineError::Connection("not connected".to_string()))
            }
            ConnectionState::Connected(Activity::Idle) if operation == Operation::Connect => {
                Err(EngineError::Connection("already connected".to_string()))
            }
            ConnectionState::Connected(Activity::Idle) => {
                state.connection = ConnectionState::Connected(Activity::Busy);
                state.running = Some(operation);
                Ok(())
            }
        }
    }

    /// Return to idle, or to disconnected if the session is gone
    pub(crate) fn release(&self, connected: bool) {
        self.release_with(connected, || {});
    }

    /// Run `deliver` and release in one step under the lock.
    ///
    /// Nobody sees the gate open before `deliver` has run, and a request
    /// submitted after `deliver` waits for the release. `deliver` must not
    /// block or touch the gate.
    pub(crate) fn release_with(&self, connected: bool, deliver: impl FnOnce()) {
        let mut state = self.state.lock();
        deliver();
        state.running = None;
        state.connection = if connected {
            ConnectionState::Connected(Activity::Idle)
        } else {
            ConnectionState::Disconnected
        };
    }

    pub(crate) fn publish(&self, info: SessionInfo) {
        self.state.lock().info = info;
    }

    pub(crate) fn connection(&self) -> ConnectionState {
        self.state.lock().connection
    }

    pub(crate) fn info(&self) -> SessionInfo {
        self.state.lock().info.clone()
    }
}

/// A connected analyzer. Owned by the worker thread for its lifetime.
pub struct InstrumentSession {
    transport: Box<dyn BusTransport>,
    address: BusAddress,
    identity: String,
    connected: bool,
    last_error: Option<ErrorKind>,
    consecutive_timeouts: usize,
    consecutive_io_failures: usize,
    limits: BusLimits,
}

impl InstrumentSession {
    /// Connect and verify the instrument identity.
    ///
    /// On failure the transport is handed back so a later connect can
    /// reuse it.
    pub fn open(
        mut transport: Box<dyn BusTransport>,
        address: &BusAddress,
        device_id: &str,
        limits: BusLimits,
    ) -> Result<Self, (Box<dyn BusTransport>, EngineError)> {
        info!("Connecting to {device_id} at {address}");
        if let Err(e) = transport.connect(address) {
            warn!("Connect to {address} failed: {e}");
            return Err((
                transport,
                EngineError::Connection(format!("failed to reach {address}: {e}")),
            ));
        }

        let command = Query::Identity.command();
        let identity = match transport.query(command) {
            Ok(response) => Protocol::decode_identity(&response),
            Err(e) => Err(EngineError::Connection(format!("{command} failed: {e}"))),
        };
        let identity = match identity {
            Ok(id) if id.contains(device_id) => id,
            Ok(id) => {
                transport.close();
                return Err((
                    transport,
                    EngineError::Connection(format!(
                        "unexpected instrument '{id}', expected {device_id}"
                    )),
                ));
            }
            Err(e) => {
                transport.close();
                let e = match e {
                    EngineError::Connection(_) => e,
                    other => EngineError::Connection(other.to_string()),
                };
                return Err((transport, e));
            }
        };

        info!("Connected to {identity} at {address}");
        Ok(Self {
            transport,
            address: address.clone(),
            identity,
            connected: true,
            last_error: None,
            consecutive_timeouts: 0,
            consecutive_io_failures: 0,
            limits,
        })
    }

    pub fn write(&mut self, command: &SetCommand) -> Result<(), EngineError> {
        let encoded = command.encode();
        self.ensure_usable()?;
        let result = self.transport.write(&encoded);
        self.record(&encoded, result)
    }

    pub fn query_text(&mut self, command: &str) -> Result<String, EngineError> {
        self.ensure_usable()?;
        let result = self.transport.query(command);
        let response = self.record(command, result)?;
        debug!("{command} returned {} bytes", response.len());
        Ok(response)
    }

    pub fn query_array(&mut self, query: Query) -> Result<Vec<f64>, EngineError> {
        let response = self.query_text(query.command())?;
        Protocol::decode_array(query.command(), &response).inspect_err(|e| self.note(e))
    }

    pub fn query_scalar(&mut self, query: Query) -> Result<f64, EngineError> {
        let response = self.query_text(query.command())?;
        Protocol::decode_scalar(query.command(), &response).inspect_err(|e| self.note(e))
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            address: self.address.clone(),
            connected: self.connected,
            last_error: self.last_error,
            identity: Some(self.identity.clone()),
        }
    }

    /// Record a workflow-level failure against the session
    pub fn note(&mut self, error: &EngineError) {
        self.last_error = Some(error.kind());
    }

    /// Disconnect and give the transport back
    pub fn close(mut self) -> Box<dyn BusTransport> {
        if self.connected {
            info!("Disconnecting from {}", self.address);
        }
        self.connected = false;
        self.transport.close();
        self.transport
    }

    fn ensure_usable(&self) -> Result<(), EngineError> {
        if self.connected {
            Ok(())
        } else {
            Err(EngineError::FatalBus(format!(
                "session to {} is no longer usable",
                self.address
            )))
        }
    }

    fn record<T>(
        &mut self,
        command: &str,
        result: Result<T, TransportError>,
    ) -> Result<T, EngineError> {
        let error = match result {
            Ok(value) => {
                self.consecutive_timeouts = 0;
                self.consecutive_io_failures = 0;
                return Ok(value);
            }
            Err(TransportError::Timeout) => {
                self.consecutive_timeouts += 1;
                warn!(
                    "Timeout on {command} ({}/{})",
                    self.consecutive_timeouts, self.limits.max_consecutive_timeouts
                );
                if self.consecutive_timeouts >= self.limits.max_consecutive_timeouts {
                    self.fail(format!(
                        "{} consecutive timeouts, last on {command}",
                        self.consecutive_timeouts
                    ))
                } else {
                    EngineError::Timeout {
                        command: command.to_string(),
                    }
                }
            }
            Err(TransportError::Closed) => self.fail(format!("link closed during {command}")),
            Err(TransportError::Io(e)) => {
                self.consecutive_io_failures += 1;
                warn!(
                    "I/O failure on {command} ({}/{}): {e}",
                    self.consecutive_io_failures, self.limits.max_consecutive_io_failures
                );
                if self.consecutive_io_failures >= self.limits.max_consecutive_io_failures {
                    self.fail(format!(
                        "{} consecutive I/O failures, last on {command}: {e}",
                        self.consecutive_io_failures
                    ))
                } else {
                    EngineError::Transport {
                        command: command.to_string(),
                        reason: e.to_string(),
                    }
                }
            }
        };
        self.last_error = Some(error.kind());
        Err(error)
    }

    fn fail(&mut self, reason: String) -> EngineError {
        error!("Bus to {} is unusable: {reason}", self.address);
        self.connected = false;
        self.transport.close();
        EngineError::FatalBus(reason)
    }
}
