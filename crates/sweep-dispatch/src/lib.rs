//! # sweep-dispatch
//!
//! At-most-once distribution of parameter sets to independent workers.
//!
//! ## Components
//!
//! - **[`backend`]**: The [`TableBackend`](backend::TableBackend) trait and its
//!   delimited-file and spreadsheet implementations
//! - **[`coordinator`]**: [`ParamCoordinator`](coordinator::ParamCoordinator),
//!   the claim / stage / complete lifecycle
//! - **[`retry`]**: Bounded retry with per-call timeouts for network calls
//! - **[`metrics`]**: Counters and histograms for claims and transitions
//!
//! ## Example
//!
//! ```rust,no_run
//! use sweep_dispatch::prelude::*;
//!
//! # async fn example(config: SweepConfig) -> Result<()> {
//! let backend = open(&config).await?;
//! let coordinator = ParamCoordinator::from_config(backend, &config);
//!
//! while let Some(claim) = coordinator.next_parameters().await? {
//!     coordinator.update_status(&claim.id, "running simulation").await?;
//!     coordinator.successful(&claim.id).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod coordinator;
pub mod metrics;
pub mod retry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backend::{
        DelimitedFileBackend, MemorySheet, SheetTransport, SheetsBackend, TableBackend, open,
    };
    pub use crate::coordinator::{ParamCoordinator, SweepSummary};
    pub use sweep_core::prelude::*;
}

pub use backend::{TableBackend, open};
pub use coordinator::{ParamCoordinator, SweepSummary};
