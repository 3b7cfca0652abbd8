pub mod protocol;
pub mod simulator;
pub mod transport;

pub use protocol::{Protocol, Query, SetCommand};
pub use simulator::{QueryFault, SWEEP_POINTS, SimulatedAnalyzer, SimulatorProbe, WriteFault};
pub use transport::{
    BusAddress, BusTransport, ConnectionConfig, PrologixTransport, PrologixTransportBuilder,
    TransportError,
};
