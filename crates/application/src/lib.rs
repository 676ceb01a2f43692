//! Application layer - Use cases and business workflows

pub mod alert_monitor;
pub mod derivation_state;
pub mod router;
pub mod supervisor;

pub use alert_monitor::AlertMonitor;
pub use derivation_state::DerivationStateMap;
pub use router::{Router, RouteOutcome};
pub use supervisor::Supervisor;
