//! rhsm-register library exports for the CLI, integration tests and fuzzing.
//!
//! The registration pipeline lives in [`orchestrator`]; [`service`] wraps
//! individual RHSM1 objects behind a readiness gate and [`bus`] is the
//! transport seam the two are written against.

pub mod bus;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod service;
pub mod stream;

// Re-export commonly used types for convenience
pub use bus::{
    BusScope, ConnectionDescriptor, OptionMap, OptionValue, SuperuserPolicy, ZbusProxyFactory,
};
pub use config::Config;
pub use error::BusError;
pub use orchestrator::{
    ActivationKeyArgs, RegisterServerService, RegistrationArgs, ServiceOptions,
};
pub use service::{ConfigService, Timeouts};
pub use stream::{Dispatcher, StreamRegistry, ValueStream};
