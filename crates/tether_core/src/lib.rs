//! Tether Core
//!
//! Engine-agnostic building blocks shared by the script bridge:
//! - Handle registries (opaque integer ids for host closures)
//! - Thread affinity (which thread may drive an engine)
//! - Cooperative cancellation

pub mod affinity;
pub mod cancel;
pub mod registry;

pub use affinity::{AffinityError, DriveGuard, EngineGuard, ThreadAffinity};
pub use cancel::{CancelCause, CancelToken};
pub use registry::{HandleId, HandleRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
