use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::analysis::FitOptions;
use crate::error::EngineError;
use crate::hp4195a::{BusAddress, BusTransport};
use crate::session::{BusLimits, ConnectionState, SessionGate, SessionInfo};
use crate::settings::MachineSettings;
use crate::settle::{RbwSettleTable, SettlePolicy};
use crate::types::{
    AcquisitionResult, AmplitudeSweepParams, AmplitudeSweepRun, PeakResult, QFactorResult,
    SweepParameters, SweepProgress,
};
use crate::workflow::Orchestrator;

/// Everything a caller can ask the engine to do
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowRequest {
    Connect,
    Disconnect,
    /// Read the current traces without touching any setting
    Acquire,
    PeakScan { center: f64, span: f64 },
    RangeScan { start: f64, stop: f64 },
    AmplitudeSweep(AmplitudeSweepParams),
    /// Single sweep at 10 Hz RBW; the previous RBW is restored afterwards
    LowResSweep,
    /// Fit the resonance around the last acquisition's peak
    QFactor,
    /// Move the center frequency onto the last peak and sweep again
    CenterOnPeak,
    ReadSettings,
    ApplySettings(SweepParameters),
    /// Send any query and return the raw response text
    RawQuery(String),
}

impl WorkflowRequest {
    pub fn operation(&self) -> Operation {
        match self {
            WorkflowRequest::Connect => Operation::Connect,
            WorkflowRequest::Disconnect => Operation::Disconnect,
            WorkflowRequest::Acquire => Operation::Acquire,
            WorkflowRequest::PeakScan { .. } => Operation::PeakScan,
            WorkflowRequest::RangeScan { .. } => Operation::RangeScan,
            WorkflowRequest::AmplitudeSweep(_) => Operation::AmplitudeSweep,
            WorkflowRequest::LowResSweep => Operation::LowResSweep,
            WorkflowRequest::QFactor => Operation::QFactor,
            WorkflowRequest::CenterOnPeak => Operation::CenterOnPeak,
            WorkflowRequest::ReadSettings => Operation::ReadSettings,
            WorkflowRequest::ApplySettings(_) => Operation::ApplySettings,
            WorkflowRequest::RawQuery(_) => Operation::RawQuery,
        }
    }
}

/// Payload-free tag of a [`WorkflowRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operation {
    Connect,
    Disconnect,
    Acquire,
    PeakScan,
    RangeScan,
    AmplitudeSweep,
    LowResSweep,
    QFactor,
    CenterOnPeak,
    ReadSettings,
    ApplySettings,
    RawQuery,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::Acquire => "acquire",
            Operation::PeakScan => "peak scan",
            Operation::RangeScan => "range scan",
            Operation::AmplitudeSweep => "amplitude sweep",
            Operation::LowResSweep => "low-resolution sweep",
            Operation::QFactor => "Q-factor fit",
            Operation::CenterOnPeak => "center on peak",
            Operation::ReadSettings => "read settings",
            Operation::ApplySettings => "apply settings",
            Operation::RawQuery => "raw query",
        };
        write!(f, "{name}")
    }
}

/// Result data carried by a successful (or partially successful) outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    Identity(String),
    Acquisition {
        result: AcquisitionResult,
        peak: Option<PeakResult>,
    },
    QFactor(QFactorResult),
    /// Also delivered for cancelled and failed sweeps
    AmplitudeSweep(AmplitudeSweepRun),
    Settings(MachineSettings),
    Response(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Exactly one of these is delivered per accepted request
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub ticket: Ticket,
    pub operation: Operation,
    pub success: bool,
    pub data: Option<Payload>,
    pub error: Option<EngineError>,
}

#[derive(Clone)]
pub struct EngineConfig {
    pub address: BusAddress,
    /// Substring the `ID?` response must contain
    pub device_id: String,
    pub limits: BusLimits,
    /// Read back center and span after writing them
    pub verify_settings: bool,
    pub settle: Arc<dyn SettlePolicy>,
    pub fit: FitOptions,
    pub initial_parameters: SweepParameters,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: BusAddress::default(),
            device_id: "HP4195A".to_string(),
            limits: BusLimits::default(),
            verify_settings: true,
            settle: Arc::new(RbwSettleTable::default()),
            fit: FitOptions::default(),
            initial_parameters: SweepParameters::default(),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("address", &self.address)
            .field("device_id", &self.device_id)
            .field("limits", &self.limits)
            .field("verify_settings", &self.verify_settings)
            .field("fit", &self.fit)
            .field("initial_parameters", &self.initial_parameters)
            .finish_non_exhaustive()
    }
}

pub(crate) enum Command {
    Run(Ticket, WorkflowRequest),
    Shutdown,
}

/// Cloneable handle that only raises the cancel flag
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct Engine;

impl Engine {
    /// Start the worker thread. The transport moves into it for good.
    pub fn spawn(
        transport: Box<dyn BusTransport>,
        config: EngineConfig,
    ) -> Result<EngineHandle, EngineError> {
        let (request_tx, request_rx) = unbounded::<Command>();
        let (outcome_tx, outcome_rx) = unbounded::<Outcome>();
        let (progress_tx, progress_rx) = unbounded::<SweepProgress>();

        let gate = Arc::new(SessionGate::new(config.address.clone()));
        let cancel = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let orchestrator = Orchestrator::new(
            transport,
            config,
            cancel.clone(),
            shutdown.clone(),
            progress_tx,
        );
        let worker_gate = gate.clone();
        let worker = thread::Builder::new()
            .name("hp4195a-worker".to_string())
            .spawn(move || worker_loop(orchestrator, worker_gate, request_rx, outcome_tx))
            .map_err(|e| EngineError::Connection(format!("failed to start worker: {e}")))?;

        Ok(EngineHandle {
            requests: request_tx,
            outcomes: outcome_rx,
            progress: progress_rx,
            gate,
            cancel,
            shutdown,
            next_ticket: AtomicU64::new(1),
            worker: Some(worker),
        })
    }
}

fn worker_loop(
    mut orchestrator: Orchestrator,
    gate: Arc<SessionGate>,
    requests: Receiver<Command>,
    outcomes: Sender<Outcome>,
) {
    debug!("Engine worker started");
    while let Ok(command) = requests.recv() {
        let (ticket, request) = match command {
            Command::Run(ticket, request) => (ticket, request),
            Command::Shutdown => break,
        };
        let operation = request.operation();
        info!("Running {operation} {ticket}");

        let execution = orchestrator.execute(ticket, request);
        if let Some(error) = &execution.error {
            warn!("{operation} {ticket} failed: {error}");
        }

        gate.publish(orchestrator.session_info());

        let outcome = Outcome {
            ticket,
            operation,
            success: execution.error.is_none(),
            data: execution.data,
            error: execution.error,
        };
        // The outcome is on the channel before the gate reports idle
        gate.release_with(orchestrator.is_connected(), || {
            if outcomes.send(outcome).is_err() {
                debug!("Outcome receiver dropped");
            }
        });
    }

    orchestrator.disconnect();
    gate.publish(orchestrator.session_info());
    gate.release(false);
    debug!("Engine worker stopped");
}

/// Caller side of a running engine.
///
/// Dropping the handle disconnects the instrument and joins the worker.
pub struct EngineHandle {
    requests: Sender<Command>,
    outcomes: Receiver<Outcome>,
    progress: Receiver<SweepProgress>,
    gate: Arc<SessionGate>,
    cancel: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    next_ticket: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Hand a request to the worker without waiting for it.
    ///
    /// Rejections (busy, not connected, already connected) are returned
    /// here and produce no outcome.
    pub fn submit(&self, request: WorkflowRequest) -> Result<Ticket, EngineError> {
        let operation = request.operation();
        self.gate.try_accept(operation)?;
        self.cancel.store(false, Ordering::SeqCst);

        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        if self.requests.send(Command::Run(ticket, request)).is_err() {
            self.gate.release(false);
            return Err(EngineError::Connection("engine worker has stopped".to_string()));
        }
        debug!("Accepted {operation} {ticket}");
        Ok(ticket)
    }

    /// Ask a running amplitude sweep to stop after its current step
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken(self.cancel.clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.gate.connection()
    }

    pub fn session(&self) -> SessionInfo {
        self.gate.info()
    }

    pub fn outcomes(&self) -> &Receiver<Outcome> {
        &self.outcomes
    }

    pub fn progress(&self) -> &Receiver<SweepProgress> {
        &self.progress
    }

    pub fn wait_outcome(&self, timeout: Duration) -> Option<Outcome> {
        match self.outcomes.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Disconnect, stop the worker and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.requests.send(Command::Shutdown);
        if worker.join().is_err() {
            warn!("Engine worker panicked");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hp4195a::{QueryFault, SimulatedAnalyzer, SimulatorProbe};
    use crate::session::Activity;
    use crate::settle::FixedSettle;
    use crate::types::RunStatus;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(10);

    fn spawn_sim(settle: Duration) -> (EngineHandle, SimulatorProbe) {
        let sim = SimulatedAnalyzer::new(1.0e6, 500.0);
        let probe = sim.probe();
        let config = EngineConfig {
            settle: Arc::new(FixedSettle(settle)),
            ..EngineConfig::default()
        };
        let handle = Engine::spawn(Box::new(sim), config).unwrap();
        (handle, probe)
    }

    fn run(handle: &EngineHandle, request: WorkflowRequest) -> Outcome {
        let ticket = handle.submit(request).unwrap();
        let outcome = handle.wait_outcome(WAIT).expect("no outcome delivered");
        assert_eq!(outcome.ticket, ticket);
        outcome
    }

    fn connected_sim(settle: Duration) -> (EngineHandle, SimulatorProbe) {
        let (handle, probe) = spawn_sim(settle);
        let outcome = run(&handle, WorkflowRequest::Connect);
        assert!(outcome.success, "{outcome:?}");
        probe.clear_log();
        (handle, probe)
    }

    #[test]
    fn test_connect_and_acquire() {
        let (handle, _probe) = spawn_sim(Duration::ZERO);
        let outcome = run(&handle, WorkflowRequest::Connect);
        assert_eq!(outcome.data, Some(Payload::Identity("HP4195A".to_string())));
        assert_eq!(handle.state(), ConnectionState::Connected(Activity::Idle));
        assert!(handle.session().connected);

        let outcome = run(&handle, WorkflowRequest::Acquire);
        assert!(outcome.success);
        match outcome.data {
            Some(Payload::Acquisition { result, peak }) => {
                assert_eq!(result.len(), crate::hp4195a::SWEEP_POINTS);
                assert!((peak.unwrap().frequency - 1.0e6).abs() < 1.0);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_requests_rejected_while_disconnected() {
        let (handle, probe) = spawn_sim(Duration::ZERO);
        assert!(matches!(
            handle.submit(WorkflowRequest::Acquire),
            Err(EngineError::Connection(_))
        ));
        assert!(probe.commands().is_empty());
        assert!(handle.wait_outcome(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_connect_twice_rejected() {
        let (handle, _probe) = connected_sim(Duration::ZERO);
        assert!(matches!(
            handle.submit(WorkflowRequest::Connect),
            Err(EngineError::Connection(_))
        ));
    }

    #[test]
    fn test_identity_mismatch_stays_disconnected() {
        let (handle, probe) = spawn_sim(Duration::ZERO);
        probe.set_identity("HP8753D");
        let outcome = run(&handle, WorkflowRequest::Connect);
        assert!(!outcome.success);
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::Connection));
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        probe.set_identity("HP4195A");
        assert!(run(&handle, WorkflowRequest::Connect).success);
    }

    #[test]
    fn test_busy_during_peak_scan() {
        let (handle, _probe) = connected_sim(Duration::from_millis(300));
        handle
            .submit(WorkflowRequest::PeakScan {
                center: 1.0e6,
                span: 2.0e4,
            })
            .unwrap();
        let err = handle.submit(WorkflowRequest::Acquire).unwrap_err();
        assert_eq!(
            err,
            EngineError::Busy {
                running: Operation::PeakScan.to_string()
            }
        );
        assert!(matches!(
            handle.submit(WorkflowRequest::Disconnect),
            Err(EngineError::Busy { .. })
        ));

        let outcome = handle.wait_outcome(WAIT).unwrap();
        assert!(outcome.success);
        assert_eq!(handle.state(), ConnectionState::Connected(Activity::Idle));
        assert!(handle.outcomes().try_recv().is_err());
        assert!(handle.submit(WorkflowRequest::Acquire).is_ok());
    }

    #[test]
    fn test_busy_during_slow_acquire() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        probe.set_query_delay(Duration::from_millis(100));
        handle.submit(WorkflowRequest::Acquire).unwrap();
        assert!(matches!(
            handle.submit(WorkflowRequest::QFactor),
            Err(EngineError::Busy { .. })
        ));
        assert!(handle.wait_outcome(WAIT).unwrap().success);
    }

    fn assert_busy(handle: &EngineHandle, running: Operation) {
        for other in [
            WorkflowRequest::Acquire,
            WorkflowRequest::QFactor,
            WorkflowRequest::RawQuery("RBW?".to_string()),
            WorkflowRequest::Disconnect,
        ] {
            assert_eq!(
                handle.submit(other).unwrap_err(),
                EngineError::Busy {
                    running: running.to_string()
                }
            );
        }
    }

    #[test]
    fn test_busy_during_sweeps() {
        let (handle, _probe) = connected_sim(Duration::from_millis(200));

        let params = AmplitudeSweepParams::from_list(vec![-10.0, 0.0], None).unwrap();
        handle
            .submit(WorkflowRequest::AmplitudeSweep(params))
            .unwrap();
        assert_busy(&handle, Operation::AmplitudeSweep);
        assert!(handle.wait_outcome(WAIT).unwrap().success);

        handle.submit(WorkflowRequest::LowResSweep).unwrap();
        assert_busy(&handle, Operation::LowResSweep);
        assert!(handle.wait_outcome(WAIT).unwrap().success);
    }

    #[test]
    fn test_busy_during_q_factor_fit() {
        let sim = SimulatedAnalyzer::new(1.0e6, 500.0);
        let config = EngineConfig {
            settle: Arc::new(FixedSettle(Duration::ZERO)),
            // A long fitted curve keeps the fit running for a while
            fit: FitOptions {
                curve_points: 2_000_000,
                ..FitOptions::default()
            },
            ..EngineConfig::default()
        };
        let handle = Engine::spawn(Box::new(sim), config).unwrap();
        assert!(run(&handle, WorkflowRequest::Connect).success);
        assert!(run(&handle, WorkflowRequest::Acquire).success);

        handle.submit(WorkflowRequest::QFactor).unwrap();
        assert_busy(&handle, Operation::QFactor);
        let outcome = handle.wait_outcome(WAIT).unwrap();
        assert!(outcome.success, "{outcome:?}");
    }

    #[test]
    fn test_range_scan_command_order() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        let outcome = run(
            &handle,
            WorkflowRequest::RangeScan {
                start: 990_000.0,
                stop: 1_010_000.0,
            },
        );
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(
            probe.commands(),
            vec![
                "CENTER = 1000000 HZ",
                "SPAN = 20000 HZ",
                "CENTER?",
                "SPAN?",
                "SWM2",
                "SWTRG",
                "A?",
                "B?",
                "X?",
            ]
        );
    }

    #[test]
    fn test_range_scan_rejects_inverted_window() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        let outcome = run(
            &handle,
            WorkflowRequest::RangeScan {
                start: 2000.0,
                stop: 1000.0,
            },
        );
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::InvalidParameter));
        assert!(probe.commands().is_empty());
        assert_eq!(handle.state(), ConnectionState::Connected(Activity::Idle));
    }

    #[test]
    fn test_read_back_mismatch_is_invalid_parameter() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        probe.inject_query_fault(Some("SPAN?"), QueryFault::Respond("5".to_string()));
        let outcome = run(
            &handle,
            WorkflowRequest::PeakScan {
                center: 1.0e6,
                span: 2.0e4,
            },
        );
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::InvalidParameter));
        assert!(!probe.commands().contains(&"SWTRG".to_string()));
    }

    #[test]
    fn test_acquire_decode_failure() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        probe.inject_query_fault(Some("B?"), QueryFault::Respond("1.0,abc".to_string()));
        let outcome = run(&handle, WorkflowRequest::Acquire);
        assert!(!outcome.success);
        assert!(outcome.data.is_none());
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::Acquisition));
        assert_eq!(handle.state(), ConnectionState::Connected(Activity::Idle));
    }

    #[test]
    fn test_acquire_length_mismatch() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        probe.inject_query_fault(Some("X?"), QueryFault::Truncate(10));
        let outcome = run(&handle, WorkflowRequest::Acquire);
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::Acquisition));
    }

    #[test]
    fn test_three_timeouts_disconnect() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        for _ in 0..3 {
            probe.inject_query_fault(Some("A?"), QueryFault::Timeout);
        }
        let kinds: Vec<_> = (0..3)
            .map(|_| run(&handle, WorkflowRequest::Acquire).error.map(|e| e.kind()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                Some(ErrorKind::Timeout),
                Some(ErrorKind::Timeout),
                Some(ErrorKind::FatalBus)
            ]
        );
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        let session = handle.session();
        assert!(!session.connected);
        assert_eq!(session.last_error, Some(ErrorKind::FatalBus));
        assert!(matches!(
            handle.submit(WorkflowRequest::Acquire),
            Err(EngineError::Connection(_))
        ));
    }

    #[test]
    fn test_amplitude_sweep_cancelled_in_step_two() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        let token = handle.cancel_token();
        probe.on_trigger(2, move || token.cancel());

        let params =
            AmplitudeSweepParams::from_list(vec![-20.0, -15.0, -10.0, -5.0, 0.0], None).unwrap();
        let outcome = run(&handle, WorkflowRequest::AmplitudeSweep(params));
        assert!(outcome.success);
        let sweep_ticket = outcome.ticket;
        let Some(Payload::AmplitudeSweep(run)) = outcome.data else {
            panic!("missing sweep payload");
        };
        assert_eq!(run.completed_steps(), 2);
        assert_eq!(run.status(), RunStatus::Cancelled);

        let commands = probe.commands();
        assert_eq!(commands.last().map(String::as_str), Some("X?"));
        assert_eq!(probe.trigger_count(), 2);
        assert_eq!(
            commands.iter().filter(|c| c.starts_with("OSC1")).count(),
            2
        );

        let progress: Vec<_> = handle.progress().try_iter().collect();
        assert_eq!(progress.len(), 2);
        assert!(progress.iter().all(|p| p.ticket == sweep_ticket));
        assert_eq!(progress[1].step_index, 1);
        assert_eq!(progress[1].total_steps, 5);
        assert_eq!(progress[1].amplitude, -15.0);
    }

    #[test]
    fn test_amplitude_sweep_completes_in_order() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        let params = AmplitudeSweepParams::from_range(-10.0, 0.0, 5.0, Some(10.0)).unwrap();
        let outcome = run(&handle, WorkflowRequest::AmplitudeSweep(params));
        let Some(Payload::AmplitudeSweep(run)) = outcome.data else {
            panic!("missing sweep payload");
        };
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.completed_steps(), 3);

        let commands = probe.commands();
        assert_eq!(commands[0], "RBW = 10 HZ");
        let osc: Vec<_> = commands.iter().filter(|c| c.starts_with("OSC1")).collect();
        assert_eq!(osc, vec!["OSC1 = -10 DBM", "OSC1 = -5 DBM", "OSC1 = 0 DBM"]);

        // Louder stimulus, louder peak
        let peaks = crate::analysis::peaks_for_run(&run);
        let first = peaks[0].as_ref().unwrap().magnitude;
        let last = peaks[2].as_ref().unwrap().magnitude;
        assert!((last - first - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_amplitude_sweep_failure_keeps_partial_run() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        probe.on_trigger(2, {
            let probe = probe.clone();
            move || probe.inject_query_fault(Some("A?"), QueryFault::Respond("x".to_string()))
        });
        let params = AmplitudeSweepParams::from_list(vec![-10.0, -5.0, 0.0], None).unwrap();
        let outcome = run(&handle, WorkflowRequest::AmplitudeSweep(params));
        assert!(!outcome.success);
        let Some(Payload::AmplitudeSweep(run)) = outcome.data else {
            panic!("missing sweep payload");
        };
        assert_eq!(run.completed_steps(), 1);
        assert_eq!(run.status(), RunStatus::Failed);
    }

    #[test]
    fn test_cancel_outside_sweep_has_no_effect() {
        let (handle, _probe) = connected_sim(Duration::ZERO);
        handle.cancel();
        let params = AmplitudeSweepParams::from_list(vec![-10.0, 0.0], None).unwrap();
        let outcome = run(&handle, WorkflowRequest::AmplitudeSweep(params));
        let Some(Payload::AmplitudeSweep(run)) = outcome.data else {
            panic!("missing sweep payload");
        };
        assert_eq!(run.status(), RunStatus::Completed);
    }

    #[test]
    fn test_low_res_sweep_restores_rbw() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        assert!(run(&handle, WorkflowRequest::LowResSweep).success);
        let commands = probe.commands();
        assert_eq!(commands.first().map(String::as_str), Some("RBW = 10 HZ"));
        assert_eq!(commands.last().map(String::as_str), Some("RBW = 100 HZ"));
    }

    #[test]
    fn test_low_res_sweep_restores_rbw_after_failure() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        probe.inject_query_fault(Some("X?"), QueryFault::Timeout);
        let outcome = run(&handle, WorkflowRequest::LowResSweep);
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::Timeout));
        assert_eq!(
            probe.commands().last().map(String::as_str),
            Some("RBW = 100 HZ")
        );
    }

    #[test]
    fn test_q_factor_needs_prior_acquisition() {
        let (handle, _probe) = connected_sim(Duration::ZERO);
        let outcome = run(&handle, WorkflowRequest::QFactor);
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::NoData));

        assert!(run(&handle, WorkflowRequest::Acquire).success);
        let outcome = run(&handle, WorkflowRequest::QFactor);
        let Some(Payload::QFactor(fit)) = outcome.data else {
            panic!("missing fit payload");
        };
        assert!(fit.fit_succeeded);
        assert!((fit.q_value - 500.0).abs() / 500.0 < 0.01);
    }

    #[test]
    fn test_center_on_peak() {
        let (handle, probe) = connected_sim(Duration::ZERO);
        assert_eq!(
            run(&handle, WorkflowRequest::CenterOnPeak).error.map(|e| e.kind()),
            Some(ErrorKind::NoData)
        );
        assert!(run(&handle, WorkflowRequest::Acquire).success);
        probe.clear_log();
        assert!(run(&handle, WorkflowRequest::CenterOnPeak).success);
        assert_eq!(probe.commands()[0], "CENTER = 1000000 HZ");
    }

    #[test]
    fn test_read_and_apply_settings() {
        let (handle, _probe) = connected_sim(Duration::ZERO);
        let params = SweepParameters::with_center_span(2.0e6, 5.0e3).unwrap();
        assert!(run(&handle, WorkflowRequest::ApplySettings(params)).success);

        let outcome = run(&handle, WorkflowRequest::ReadSettings);
        let Some(Payload::Settings(settings)) = outcome.data else {
            panic!("missing settings payload");
        };
        assert_eq!(settings.device_id.as_deref(), Some("HP4195A"));
        assert_eq!(settings.center_frequency, Some(2.0e6));
        assert_eq!(settings.span, Some(5.0e3));
        assert_eq!(settings.resolution_bandwidth, Some(100.0));
    }

    #[test]
    fn test_raw_query() {
        let (handle, _probe) = connected_sim(Duration::ZERO);
        let outcome = run(&handle, WorkflowRequest::RawQuery("ID?".to_string()));
        assert_eq!(outcome.data, Some(Payload::Response("HP4195A".to_string())));
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let (handle, _probe) = connected_sim(Duration::ZERO);
        assert!(run(&handle, WorkflowRequest::Disconnect).success);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(run(&handle, WorkflowRequest::Connect).success);
    }

    #[test]
    fn test_shutdown_interrupts_settle_wait() {
        let (handle, _probe) = connected_sim(Duration::from_secs(60));
        handle.submit(WorkflowRequest::LowResSweep).unwrap();
        let start = Instant::now();
        handle.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
