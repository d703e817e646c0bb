//! Session, consumer, and client-health tracking
//!
//! The registry, crash detector, and consumer manager are three
//! independently addressable services sharing session ids as their only
//! coupling; none of them holds pointers into another.

pub mod consumers;
pub mod crash;
pub mod fingerprint;
pub mod registry;

pub use consumers::{ConsumerManager, ConsumerSnapshot};
pub use crash::{CrashDetector, HealthVerdict};
pub use fingerprint::ClientFingerprint;
pub use registry::{
    ActivityView, ConcurrencyMetrics, SessionRegistry, SessionSnapshot, SessionState,
    TeardownReason,
};
