// Shared types for the usage portal: identifiers, slurmdbd records, allocations, PromQL
// templates and the plotly-shaped chart payloads built from Prometheus series.
//
// Nothing in here does I/O. The `api` crate owns the clients and only hands finished
// series/rows to the functions below.
pub mod account;
pub mod allocation;
pub mod chart;
pub mod graph;
pub mod job;
pub mod misc;
pub mod pagination;
pub mod promql;
pub mod series;
pub mod window;

/// Jobs per page on account and user listings.
pub const PAGE_SIZE: u64 = 100;

/// How timestamps are rendered on chart x axes.
pub const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";
