//! Bay kernel: the sandbox/session lifecycle engine.
//!
//! The managers here implement the user-facing contract: sandboxes aggregate
//! a cargo volume, a profile, and at most one live session; compute is
//! lazily materialized by `ensure_running` on the first capability call and
//! reclaimed by the garbage collector. All sandbox mutations are serialized
//! through the per-sandbox lock registry plus a row lock where the database
//! engine supports one.

pub mod cargo;
pub mod config;
pub mod error;
pub mod gc;
pub mod http;
pub mod locks;
pub mod router;
pub mod sandbox;
pub mod session;

pub use cargo::CargoManager;
pub use config::{build_driver, DriverConfig, GcConfig, ProfileRegistry};
pub use error::{BayError, BayResult};
pub use gc::{GarbageCollector, GcReport};
pub use http::RuntimeClient;
pub use locks::{LockHandle, LockRegistry};
pub use router::{require_capability, resolve_endpoint, ResolvedCapability};
pub use sandbox::{SandboxListItem, SandboxManager};
pub use session::{ReadinessConfig, SessionManager};
