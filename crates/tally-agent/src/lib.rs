//! Producer side of the tally metrics exchange.
//!
//! [`runner::CollectionLoop`] samples the host into a
//! [`MetricSnapshot`](tally_collector::snapshot::MetricSnapshot) on one timer
//! and reports it through [`uploader::Uploader`] on another.

pub mod config;
pub mod runner;
pub mod transport;
pub mod uploader;
