use chrono::Utc;
use crossbeam_channel::Sender;
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::analysis::{find_peak, fit_q_factor_with};
use crate::engine::{EngineConfig, Payload, Ticket, WorkflowRequest};
use crate::error::{EngineError, ErrorKind};
use crate::hp4195a::{BusTransport, Protocol, Query, SetCommand};
use crate::session::{InstrumentSession, SessionInfo};
use crate::settings::{ConnectionStatus, MachineSettings};
use crate::settle;
use crate::types::{
    AcquisitionResult, AmplitudeSweepParams, AmplitudeSweepRun, LOW_RES_RBW_HZ, PeakResult,
    RunStatus, SweepMode, SweepParameters, SweepProgress,
};

/// What a workflow produced. A failed amplitude sweep carries both.
pub(crate) struct Execution {
    pub data: Option<Payload>,
    pub error: Option<EngineError>,
}

impl From<Result<Option<Payload>, EngineError>> for Execution {
    fn from(result: Result<Option<Payload>, EngineError>) -> Self {
        match result {
            Ok(data) => Execution { data, error: None },
            Err(error) => Execution {
                data: None,
                error: Some(error),
            },
        }
    }
}

/// Runs workflows on the worker thread.
///
/// Holds the transport while disconnected and the session while
/// connected, never both.
pub(crate) struct Orchestrator {
    config: EngineConfig,
    transport: Option<Box<dyn BusTransport>>,
    session: Option<InstrumentSession>,
    params: SweepParameters,
    last_acquisition: Option<AcquisitionResult>,
    last_peak: Option<PeakResult>,
    last_error: Option<ErrorKind>,
    cancel: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    progress: Sender<SweepProgress>,
}

impl Orchestrator {
    pub(crate) fn new(
        transport: Box<dyn BusTransport>,
        config: EngineConfig,
        cancel: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
        progress: Sender<SweepProgress>,
    ) -> Self {
        let params = config.initial_parameters.clone();
        Self {
            config,
            transport: Some(transport),
            session: None,
            params,
            last_acquisition: None,
            last_peak: None,
            last_error: None,
            cancel,
            shutdown,
            progress,
        }
    }

    pub(crate) fn execute(&mut self, ticket: Ticket, request: WorkflowRequest) -> Execution {
        let execution: Execution = match request {
            WorkflowRequest::Connect => self.connect().map(Some).into(),
            WorkflowRequest::Disconnect => {
                self.disconnect();
                Execution {
                    data: None,
                    error: None,
                }
            }
            WorkflowRequest::Acquire => self.acquire_and_record().map(Some).into(),
            WorkflowRequest::PeakScan { center, span } => {
                let mut params = self.params.clone();
                params
                    .set_center_span(center, span)
                    .and_then(|_| self.scan(params))
                    .map(Some)
                    .into()
            }
            WorkflowRequest::RangeScan { start, stop } => {
                let mut params = self.params.clone();
                params
                    .set_start_stop(start, stop)
                    .and_then(|_| self.scan(params))
                    .map(Some)
                    .into()
            }
            WorkflowRequest::AmplitudeSweep(sweep) => {
                let (run, error) = self.amplitude_sweep(ticket, &sweep);
                Execution {
                    data: Some(Payload::AmplitudeSweep(run)),
                    error,
                }
            }
            WorkflowRequest::LowResSweep => self.low_res_sweep().map(Some).into(),
            WorkflowRequest::QFactor => self.q_factor().map(Some).into(),
            WorkflowRequest::CenterOnPeak => self.center_on_peak().map(Some).into(),
            WorkflowRequest::ReadSettings => self.read_settings().map(Some).into(),
            WorkflowRequest::ApplySettings(params) => self.apply_settings(params).map(Some).into(),
            WorkflowRequest::RawQuery(command) => self
                .session()
                .and_then(|s| s.query_text(&command))
                .map(|text| Some(Payload::Response(text)))
                .into(),
        };

        if let Some(error) = &execution.error {
            self.last_error = Some(error.kind());
            if let Some(session) = self.session.as_mut() {
                session.note(error);
            }
        }
        self.drop_dead_session();
        execution
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_connected())
    }

    pub(crate) fn session_info(&self) -> SessionInfo {
        match &self.session {
            Some(session) => session.info(),
            None => SessionInfo {
                address: self.config.address.clone(),
                connected: false,
                last_error: self.last_error,
                identity: None,
            },
        }
    }

    pub(crate) fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            self.transport = Some(session.close());
        }
    }

    fn drop_dead_session(&mut self) {
        if self.session.as_ref().is_some_and(|s| !s.is_connected()) {
            warn!("Session to {} lost, disconnecting", self.config.address);
            self.disconnect();
        }
    }

    fn session(&mut self) -> Result<&mut InstrumentSession, EngineError> {
        self.session
            .as_mut()
            .ok_or_else(|| EngineError::Connection("not connected".to_string()))
    }

    fn connect(&mut self) -> Result<Payload, EngineError> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| EngineError::Connection("transport unavailable".to_string()))?;
        match InstrumentSession::open(
            transport,
            &self.config.address,
            &self.config.device_id,
            self.config.limits,
        ) {
            Ok(session) => {
                let identity = session.identity().to_string();
                self.session = Some(session);
                self.last_error = None;
                Ok(Payload::Identity(identity))
            }
            Err((transport, error)) => {
                self.transport = Some(transport);
                Err(error)
            }
        }
    }

    fn acquire(&mut self) -> Result<AcquisitionResult, EngineError> {
        let session = self.session()?;
        let magnitude = trace(session, Query::Magnitude)?;
        let phase = trace(session, Query::Phase)?;
        let frequency = trace(session, Query::Frequency)?;
        let result = AcquisitionResult::new(magnitude, phase, frequency)?;
        info!("Acquired {} points", result.len());
        Ok(result)
    }

    fn record(&mut self, result: AcquisitionResult) -> Payload {
        let peak = find_peak(&result).ok();
        if let Some(peak) = &peak {
            info!(
                "Peak at {:.3} Hz, {:.2} dBm",
                peak.frequency, peak.magnitude
            );
        }
        self.last_acquisition = Some(result.clone());
        self.last_peak = peak;
        Payload::Acquisition { result, peak }
    }

    fn acquire_and_record(&mut self) -> Result<Payload, EngineError> {
        let result = self.acquire()?;
        Ok(self.record(result))
    }

    /// Trigger one sweep, wait for it to settle, then read the traces
    fn single_sweep(&mut self) -> Result<AcquisitionResult, EngineError> {
        let session = self.session()?;
        session.write(&SetCommand::SweepMode(SweepMode::Single))?;
        session.write(&SetCommand::Trigger)?;
        self.params.set_sweep_mode(SweepMode::Single);

        let rbw = self.params.resolution_bandwidth();
        let settle_time = self.config.settle.settle_time(rbw);
        info!("Sweep triggered, settling {settle_time:?} at RBW {rbw} Hz");
        if !settle::wait(settle_time, &self.shutdown) {
            return Err(EngineError::Acquisition(
                "sweep interrupted by engine shutdown".to_string(),
            ));
        }
        self.acquire()
    }

    fn write_window(&mut self, params: &SweepParameters) -> Result<(), EngineError> {
        let verify = self.config.verify_settings;
        let session = self.session()?;
        session.write(&SetCommand::Center(params.center_frequency()))?;
        session.write(&SetCommand::Span(params.span()))?;
        if verify {
            verify_setting(session, Query::Center, params.center_frequency())?;
            verify_setting(session, Query::Span, params.span())?;
        }
        Ok(())
    }

    fn scan(&mut self, params: SweepParameters) -> Result<Payload, EngineError> {
        info!(
            "Scanning {:.1} Hz to {:.1} Hz",
            params.start_frequency(),
            params.stop_frequency()
        );
        self.write_window(&params)?;
        self.params = params;
        let result = self.single_sweep()?;
        Ok(self.record(result))
    }

    fn set_resolution_bandwidth(&mut self, rbw: f64) -> Result<(), EngineError> {
        let mut params = self.params.clone();
        params.set_resolution_bandwidth(rbw)?;
        self.session()?
            .write(&SetCommand::ResolutionBandwidth(rbw))?;
        self.params = params;
        Ok(())
    }

    fn low_res_sweep(&mut self) -> Result<Payload, EngineError> {
        let prior = self.params.resolution_bandwidth();
        let result = self
            .set_resolution_bandwidth(LOW_RES_RBW_HZ)
            .and_then(|_| self.single_sweep())
            .map(|result| self.record(result));

        if self.is_connected() {
            if let Err(e) = self.set_resolution_bandwidth(prior) {
                warn!("Failed to restore RBW {prior} Hz: {e}");
                if result.is_ok() {
                    return Err(e);
                }
            }
        }
        result
    }

    fn amplitude_sweep(
        &mut self,
        ticket: Ticket,
        sweep: &AmplitudeSweepParams,
    ) -> (AmplitudeSweepRun, Option<EngineError>) {
        let mut run = AmplitudeSweepRun::new(sweep.amplitudes().to_vec());
        let total_steps = run.total_steps();
        info!("Amplitude sweep over {total_steps} steps");

        if let Some(rbw) = sweep.resolution_bandwidth() {
            if let Err(e) = self.set_resolution_bandwidth(rbw) {
                run.finish(RunStatus::Failed);
                return (run, Some(e));
            }
        }

        for (step_index, &amplitude) in sweep.amplitudes().iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                info!("Amplitude sweep cancelled after {step_index} of {total_steps} steps");
                run.finish(RunStatus::Cancelled);
                return (run, None);
            }

            match self.sweep_step(amplitude) {
                Ok(result) => {
                    run.push(result);
                    let _ = self.progress.send(SweepProgress {
                        ticket,
                        step_index,
                        total_steps,
                        amplitude,
                    });
                    info!(
                        "Step {}/{total_steps} done at {amplitude} dBm",
                        step_index + 1
                    );
                }
                Err(e) => {
                    run.finish(RunStatus::Failed);
                    return (run, Some(e));
                }
            }
        }

        run.finish(RunStatus::Completed);
        (run, None)
    }

    fn sweep_step(&mut self, amplitude: f64) -> Result<AcquisitionResult, EngineError> {
        let mut params = self.params.clone();
        params.set_oscillator_amplitude(amplitude)?;
        self.session()?
            .write(&SetCommand::OscillatorAmplitude(amplitude))?;
        self.params = params;

        let result = self.single_sweep()?;
        self.record(result.clone());
        Ok(result)
    }

    fn q_factor(&mut self) -> Result<Payload, EngineError> {
        let (Some(result), Some(peak)) = (&self.last_acquisition, &self.last_peak) else {
            return Err(EngineError::NoData(
                "Q-factor needs an acquisition with a peak".to_string(),
            ));
        };
        let fit = fit_q_factor_with(result, peak, &self.config.fit);
        if fit.fit_succeeded {
            info!("Q = {:.1} at {:.3} Hz", fit.q_value, fit.center_frequency);
        } else {
            warn!("Q-factor fit did not succeed");
        }
        Ok(Payload::QFactor(fit))
    }

    fn center_on_peak(&mut self) -> Result<Payload, EngineError> {
        let peak = self
            .last_peak
            .ok_or_else(|| EngineError::NoData("no peak to center on".to_string()))?;
        let mut params = self.params.clone();
        params.set_center_span(peak.frequency, params.span())?;
        self.scan(params)
    }

    fn read_settings(&mut self) -> Result<Payload, EngineError> {
        let mode = self.params.sweep_mode();
        let session = self.session()?;
        let identity = Protocol::decode_identity(&session.query_text(Query::Identity.command())?)?;

        let mut settings = MachineSettings {
            device_id: Some(identity),
            connection_status: ConnectionStatus::Connected,
            center_frequency: Some(session.query_scalar(Query::Center)?),
            span: Some(session.query_scalar(Query::Span)?),
            start_frequency: Some(session.query_scalar(Query::Start)?),
            stop_frequency: Some(session.query_scalar(Query::Stop)?),
            resolution_bandwidth: Some(session.query_scalar(Query::ResolutionBandwidth)?),
            oscillator_1_amplitude: Some(session.query_scalar(Query::OscillatorAmplitude)?),
            sweep_mode: Some(mode),
            last_updated: Some(Utc::now()),
        };

        match settings.to_parameters() {
            Ok(params) => self.params = params,
            Err(e) => {
                warn!("Instrument reported inconsistent settings: {e}");
                settings.sweep_mode = None;
            }
        }
        Ok(Payload::Settings(settings))
    }

    fn apply_settings(&mut self, params: SweepParameters) -> Result<Payload, EngineError> {
        self.write_window(&params)?;
        let session = self.session()?;
        session.write(&SetCommand::ResolutionBandwidth(params.resolution_bandwidth()))?;
        session.write(&SetCommand::OscillatorAmplitude(params.oscillator_amplitude()))?;
        self.params = params;

        let mut settings = MachineSettings::from_parameters(&self.params);
        settings.connection_status = ConnectionStatus::Connected;
        settings.device_id = self.session.as_ref().map(|s| s.identity().to_string());
        Ok(Payload::Settings(settings))
    }
}

fn trace(session: &mut InstrumentSession, query: Query) -> Result<Vec<f64>, EngineError> {
    session.query_array(query).map_err(|e| match e {
        EngineError::Decode { command, reason } => {
            EngineError::Acquisition(format!("{command}: {reason}"))
        }
        other => other,
    })
}

fn verify_setting(
    session: &mut InstrumentSession,
    query: Query,
    expected: f64,
) -> Result<(), EngineError> {
    let actual = session.query_scalar(query)?;
    let tolerance = 1e-6 * expected.abs().max(1.0);
    if (actual - expected).abs() > tolerance {
        warn!(
            "{} read back {actual}, expected {expected}",
            query.command()
        );
        return Err(EngineError::InvalidParameter(format!(
            "instrument reports {actual} for {}, requested {expected}",
            query.command()
        )));
    }
    Ok(())
}
