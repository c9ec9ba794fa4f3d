//! Shared vocabulary for the quorum workspace: identifiers, cluster
//! configuration, the error type and the metrics seam.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;
