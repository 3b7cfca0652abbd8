use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::protocol::{Protocol, Query, SetCommand};
use super::transport::{BusAddress, BusTransport, TransportError};
use crate::types::SweepParameters;

/// Number of points per trace on the HP4195A
pub const SWEEP_POINTS: usize = 401;

/// Failure to inject into a future query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFault {
    /// The query times out
    Timeout,
    /// The query returns this text instead of the real response
    Respond(String),
    /// Trace queries return only the first `n` points
    Truncate(usize),
    /// The link drops
    Closed,
}

/// Failure to inject into a future write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteFault {
    Timeout,
    Io,
    Closed,
}

type TriggerHook = Box<dyn FnMut() + Send>;

struct ProbeState {
    log: Vec<String>,
    query_faults: VecDeque<(Option<String>, QueryFault)>,
    write_faults: VecDeque<WriteFault>,
    trigger_hooks: Vec<(usize, TriggerHook)>,
    triggers: usize,
    refuse_connect: bool,
    identity: String,
    query_delay: Duration,
}

/// Observation and fault-injection handle for a [`SimulatedAnalyzer`].
///
/// The probe never talks to the simulated bus itself; it only records
/// what the engine sent and arms faults for later calls.
#[derive(Clone)]
pub struct SimulatorProbe {
    inner: Arc<Mutex<ProbeState>>,
}

impl SimulatorProbe {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProbeState {
                log: Vec::new(),
                query_faults: VecDeque::new(),
                write_faults: VecDeque::new(),
                trigger_hooks: Vec::new(),
                triggers: 0,
                refuse_connect: false,
                identity: "HP4195A".to_string(),
                query_delay: Duration::ZERO,
            })),
        }
    }

    /// Every command sent over the simulated bus, in order
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }

    /// Number of `SWTRG` commands received so far
    pub fn trigger_count(&self) -> usize {
        self.inner.lock().triggers
    }

    /// Fail the next query, or the next query of `command` when given
    pub fn inject_query_fault(&self, command: Option<&str>, fault: QueryFault) {
        self.inner
            .lock()
            .query_faults
            .push_back((command.map(str::to_string), fault));
    }

    pub fn inject_write_fault(&self, fault: WriteFault) {
        self.inner.lock().write_faults.push_back(fault);
    }

    /// Run `hook` when the `n`-th sweep trigger (1-based) arrives
    pub fn on_trigger(&self, n: usize, hook: impl FnMut() + Send + 'static) {
        self.inner.lock().trigger_hooks.push((n, Box::new(hook)));
    }

    pub fn set_identity(&self, identity: &str) {
        self.inner.lock().identity = identity.to_string();
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.inner.lock().refuse_connect = refuse;
    }

    /// Artificial latency added to every query
    pub fn set_query_delay(&self, delay: Duration) {
        self.inner.lock().query_delay = delay;
    }
}

/// In-process model of an HP4195A with a single resonance.
///
/// Speaks the same command vocabulary as the real instrument: set
/// commands update the model, trace queries return the Lorentzian
/// response of the current frequency window.
pub struct SimulatedAnalyzer {
    params: SweepParameters,
    resonance_hz: f64,
    q_factor: f64,
    gain_db: f64,
    connected: bool,
    probe: SimulatorProbe,
}

impl SimulatedAnalyzer {
    pub fn new(resonance_hz: f64, q_factor: f64) -> Self {
        let mut params = SweepParameters::default();
        let span = (resonance_hz / q_factor * 10.0).max(1.0);
        // A positive span and finite resonance always form a valid window
        if params.set_center_span(resonance_hz, span).is_err() {
            params = SweepParameters::default();
        }
        Self {
            params,
            resonance_hz,
            q_factor,
            gain_db: -20.0,
            connected: false,
            probe: SimulatorProbe::new(),
        }
    }

    pub fn probe(&self) -> SimulatorProbe {
        self.probe.clone()
    }

    pub fn resonance_hz(&self) -> f64 {
        self.resonance_hz
    }

    pub fn q_factor(&self) -> f64 {
        self.q_factor
    }

    fn frequencies(&self) -> Vec<f64> {
        let start = self.params.start_frequency();
        let step = self.params.span() / (SWEEP_POINTS - 1) as f64;
        (0..SWEEP_POINTS).map(|i| start + i as f64 * step).collect()
    }

    fn magnitude_dbm(&self, f: f64) -> f64 {
        let half_width = self.resonance_hz / self.q_factor / 2.0;
        let lorentzian = half_width.powi(2) / ((f - self.resonance_hz).powi(2) + half_width.powi(2));
        self.params.oscillator_amplitude() + self.gain_db + 10.0 * lorentzian.log10()
    }

    fn phase_deg(&self, f: f64) -> f64 {
        let half_width = self.resonance_hz / self.q_factor / 2.0;
        -((f - self.resonance_hz) / half_width).atan().to_degrees()
    }

    fn respond(&self, query: Query) -> String {
        match query {
            Query::Identity => self.probe.inner.lock().identity.clone(),
            Query::Magnitude => Protocol::encode_array(
                &self
                    .frequencies()
                    .into_iter()
                    .map(|f| self.magnitude_dbm(f))
                    .collect::<Vec<_>>(),
            ),
            Query::Phase => Protocol::encode_array(
                &self
                    .frequencies()
                    .into_iter()
                    .map(|f| self.phase_deg(f))
                    .collect::<Vec<_>>(),
            ),
            Query::Frequency => Protocol::encode_array(&self.frequencies()),
            Query::Center => self.params.center_frequency().to_string(),
            Query::Span => self.params.span().to_string(),
            Query::Start => self.params.start_frequency().to_string(),
            Query::Stop => self.params.stop_frequency().to_string(),
            Query::ResolutionBandwidth => self.params.resolution_bandwidth().to_string(),
            Query::OscillatorAmplitude => self.params.oscillator_amplitude().to_string(),
        }
    }

    fn apply(&mut self, command: SetCommand) {
        // Out-of-range values are ignored, like a front panel entry error
        let _ = match command {
            SetCommand::Center(hz) => {
                let span = self.params.span();
                self.params.set_center_span(hz, span)
            }
            SetCommand::Span(hz) => {
                let center = self.params.center_frequency();
                self.params.set_center_span(center, hz)
            }
            SetCommand::Start(hz) => {
                let stop = self.params.stop_frequency();
                self.params.set_start_stop(hz, stop)
            }
            SetCommand::Stop(hz) => {
                let start = self.params.start_frequency();
                self.params.set_start_stop(start, hz)
            }
            SetCommand::ResolutionBandwidth(hz) => self.params.set_resolution_bandwidth(hz),
            SetCommand::OscillatorAmplitude(dbm) => self.params.set_oscillator_amplitude(dbm),
            SetCommand::SweepMode(mode) => {
                self.params.set_sweep_mode(mode);
                Ok(())
            }
            SetCommand::Trigger => {
                self.fire_trigger();
                Ok(())
            }
        };
    }

    fn fire_trigger(&mut self) {
        let due: Vec<TriggerHook> = {
            let mut state = self.probe.inner.lock();
            state.triggers += 1;
            let count = state.triggers;
            let (due, pending): (Vec<_>, Vec<_>) = state
                .trigger_hooks
                .drain(..)
                .partition(|(n, _)| *n == count);
            state.trigger_hooks = pending;
            due.into_iter().map(|(_, hook)| hook).collect()
        };
        for mut hook in due {
            hook();
        }
    }

    fn take_query_fault(&self, command: &str) -> Option<QueryFault> {
        let mut state = self.probe.inner.lock();
        let position = state.query_faults.iter().position(|(target, _)| {
            target
                .as_deref()
                .is_none_or(|t| t.eq_ignore_ascii_case(command))
        })?;
        state.query_faults.remove(position).map(|(_, fault)| fault)
    }
}

impl BusTransport for SimulatedAnalyzer {
    fn connect(&mut self, address: &BusAddress) -> Result<(), TransportError> {
        if self.probe.inner.lock().refuse_connect {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no adapter at {address}"),
            )));
        }
        debug!("Simulated analyzer attached at {address}");
        self.connected = true;
        Ok(())
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        let fault = {
            let mut state = self.probe.inner.lock();
            state.log.push(command.to_string());
            state.write_faults.pop_front()
        };
        match fault {
            Some(WriteFault::Timeout) => return Err(TransportError::Timeout),
            Some(WriteFault::Io) => {
                return Err(TransportError::Io(std::io::Error::other(
                    "simulated write failure",
                )));
            }
            Some(WriteFault::Closed) => {
                self.connected = false;
                return Err(TransportError::Closed);
            }
            None => {}
        }

        match SetCommand::parse(command) {
            Some(set) => self.apply(set),
            None => debug!("Simulator ignoring unknown command {command:?}"),
        }
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        let delay = {
            let mut state = self.probe.inner.lock();
            state.log.push(command.to_string());
            state.query_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let query = Query::from_command(command);
        match self.take_query_fault(command) {
            Some(QueryFault::Timeout) => return Err(TransportError::Timeout),
            Some(QueryFault::Respond(text)) => return Ok(text),
            Some(QueryFault::Closed) => {
                self.connected = false;
                return Err(TransportError::Closed);
            }
            Some(QueryFault::Truncate(n)) => {
                if let Some(query) = query {
                    let full = self.respond(query);
                    return Ok(full.split(',').take(n).collect::<Vec<_>>().join(","));
                }
            }
            None => {}
        }

        match query {
            Some(query) => Ok(self.respond(query)),
            // The real instrument stays silent on unknown queries
            None => Err(TransportError::Timeout),
        }
    }

    fn close(&mut self) {
        self.connected = false;
    }
}
