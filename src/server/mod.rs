//! Exchange-side components: per-client state and the simulator loop.

pub mod clients;
pub mod simulator;

pub use clients::{ClientConnection, ClientManager};
pub use simulator::{ExchangeSimulator, SimulatorConfig};
