// Causalite - causal-order message delivery over point-to-point TCP

pub mod clock;
pub mod config;
pub mod message;
pub mod process;

pub use clock::{Deliverability, DependencyClock, DependencySet, ProcessId, TimeVector};
pub use config::{Config, ConfigError};
pub use message::Envelope;
pub use process::{Process, ProcessError, ProcessStats};
