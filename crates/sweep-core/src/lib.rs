//! # sweep-core
//!
//! Core types for the sweep parameter dispatcher.
//!
//! This crate provides the shared vocabulary used by every sweep component:
//!
//! - **Rows**: Parameter-set records and the field changes applied to them
//! - **Status**: The row status state machine (`pending` → `claimed` → stages → terminal)
//! - **Error Types**: The closed error taxonomy surfaced to callers
//! - **Configuration**: Process-wide, read-only sweep configuration
//! - **Overlay**: Merging of global defaults with per-row parameters
//!
//! ## Crate Boundary
//!
//! `sweep-core` performs no I/O against the parameter table. Table backends and
//! the coordinator live in `sweep-dispatch`.
//!
//! ## Example
//!
//! ```rust
//! use sweep_core::prelude::*;
//!
//! let status: Status = "claimed".parse().unwrap();
//! assert!(status.can_transition_to(&Status::Success));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod observability;
pub mod overlay;
pub mod row;
pub mod status;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use sweep_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{BackendConfig, SweepConfig};
    pub use crate::error::{Error, Result};
    pub use crate::overlay::{Claim, ParameterMap, merge};
    pub use crate::row::{FieldChanges, Row, RowId};
    pub use crate::status::Status;
}

pub use config::{BackendConfig, SweepConfig};
pub use error::{Error, Result};
pub use observability::{LogFormat, init_logging};
pub use overlay::{Claim, ParameterMap, merge};
pub use row::{FieldChanges, Row, RowId};
pub use status::Status;
