//! Builds QRank, a popularity signal for knowledge-graph entities, by
//! aggregating a year of Wikimedia pageview telemetry and joining it
//! against the sitelinks of a Wikidata entity dump. Everything runs as a
//! restartable batch pipeline over compressed, sorted line files.

pub mod combine;
pub mod dump;
pub mod entities;
pub mod group;
pub mod io;
pub mod keys;
pub mod merge;
pub mod pageviews;
pub mod pipeline;
pub mod qrank;
pub mod qviews;
pub mod sort;
pub mod stats;
pub mod storage;
pub mod util;

pub use group::{cancel_pair, is_cancelled, run_group, CancelHandle, CancelToken, Cancelled};
pub use pipeline::{compute_qrank, BuildConfig};
