//! Security policy model: what a single execution may do.
//!
//! Policies are plain data. Four presets ordered by privilege, plus custom
//! policies that must pass the same invariants.
//!
//! # Modules
//!
//! - [`capability`]: `Capability` axes and the command-to-capability map
//! - [`security`]: `SecurityLevel`, `SecurityPolicy`, presets
//! - [`resolve`]: `PolicySelector` and `resolve()`
//! - [`guard`]: `PolicyGuard`, the dispatch-time enforcement hook
//! - [`preflight`]: static scan for restricted command names
//! - [`error`]: `PolicyError` / `PolicyResult`

pub mod capability;
pub mod error;
pub mod guard;
pub mod preflight;
pub mod resolve;
pub mod security;

pub use capability::Capability;
pub use error::{PolicyError, PolicyResult};
pub use guard::PolicyGuard;
pub use preflight::preflight;
pub use resolve::{resolve, PolicySelector};
pub use security::{normalize_lexically, SecurityLevel, SecurityPolicy};
