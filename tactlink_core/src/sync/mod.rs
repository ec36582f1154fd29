//! Clock synchronization.
//!
//! PTP-style four-timestamp offset estimation with MAD outlier
//! rejection ([`engine`]), a warm-start cache surviving brief
//! disconnects ([`cache`]), and the adaptive per-batch scheduling
//! horizon ([`lead_time`]).

pub mod cache;
pub mod engine;
pub mod lead_time;

pub use cache::WarmStartCache;
pub use engine::{AcceptedSample, SyncEngine, SyncStats};
pub use lead_time::LeadTimeEstimator;
