//! Scan Core
//!
//! Everything between a scan request and its findings: the control
//! catalog, the check registry, the execution harness, aggregation, the
//! lifecycle orchestrator, and the remediation ticket bridge.

pub mod aggregate;
pub mod error;
pub mod frameworks;
pub mod harness;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod tickets;
pub mod types;

pub use error::{ApiError, ScanError};
pub use frameworks::ControlCatalog;
pub use harness::HarnessConfig;
pub use orchestrator::Orchestrator;
pub use registry::CheckRegistry;
pub use store::ScanStore;
pub use tickets::TicketBridge;
