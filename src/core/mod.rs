//! Core gateway machinery shared by both proxy engines:
//! - Safety/auth registry (per-IP failure tracking and blacklisting)
//! - Bidirectional relay with idle-timeout race
//! - Header value templating

pub mod relay;
pub mod safety;
pub mod template;

pub use relay::{copy_bidirectional_idle, RelayOutcome};
pub use safety::{SafetyRecord, SafetyRegistry};
pub use template::{RequestContext, Template, VarRegistry};
