//! Config-specs domain: the HTTP binding and the specs data adapter.

mod adapter;
mod client;

pub use adapter::{SpecsBinding, SpecsDataAdapter, SPECS_CACHE_SUFFIX};
pub use client::HttpSpecsFetcher;
