//! P3 proposal metrics.
//!
//! Attributes "P3 - Proposal" meetings to employees and correlates them with
//! the deals they produced, over all-time, year-to-date and month-to-date
//! windows. Records come from a `RecordStore` (local SQLite mirror or a
//! PostgREST endpoint); `pipeline::compute_dashboard` is the entry point.

pub mod aggregate;
pub mod config;
pub mod error;
mod migrations;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{ErrorReport, MetricsError};
pub use pipeline::{compute_dashboard, compute_removed_deals, DashboardReport, RemovedDealsReport};
