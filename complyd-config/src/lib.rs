//! Configuration loading for complyd.
//!
//! The controller reads its tuning from a file or environment once at
//! process start; the receiver and collector are configured from their
//! command line. Both end up as plain structs handed to the code that needs
//! them, nothing here is global.

pub mod controller;
pub mod endpoints;
pub mod util;
pub mod validation;

pub use controller::{ConfigSource, ControllerSettings};
pub use endpoints::{CollectorConfig, EndpointConfigError, ReceiverConfig, TlsPaths};
pub use validation::{ConfigGuardRailError, validate_controller};
