pub mod analysis;
pub mod engine;
pub mod error;
pub mod export;
pub mod hp4195a;
pub mod plotting;
pub mod session;
pub mod settings;
pub mod settle;
pub mod types;
mod workflow;

pub use analysis::{FitOptions, find_peak, fit_q_factor, fit_q_factor_with, peaks_for_run};
pub use engine::{
    CancelToken, Engine, EngineConfig, EngineHandle, Operation, Outcome, Payload, Ticket,
    WorkflowRequest,
};
pub use error::{EngineError, ErrorKind};
pub use hp4195a::{
    BusAddress, BusTransport, ConnectionConfig, PrologixTransport, PrologixTransportBuilder,
    QueryFault, SimulatedAnalyzer, SimulatorProbe, TransportError, WriteFault,
};
pub use plotting::{plot_fit, plot_series, plot_trace};
pub use session::{Activity, BusLimits, ConnectionState, InstrumentSession, SessionInfo};
pub use settings::{ConnectionStatus, MachineSettings, SettingsExport};
pub use settle::{FixedSettle, RbwSettleTable, SettleEntry, SettlePolicy};
pub use types::{
    AcquisitionResult, AmplitudeSweepParams, AmplitudeSweepRun, PeakResult, QFactorResult,
    RunStatus, SweepMode, SweepParameters, SweepProgress,
};
