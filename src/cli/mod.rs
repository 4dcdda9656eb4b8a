pub mod commands;
pub mod simulate;

pub use commands::{Cli, Commands, ConfigCommand};
pub use simulate::{run_simulation, SimulationReport};
