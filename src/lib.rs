//! Offline-first synchronization core for remotely authored config specs.
//!
//! [`specs::SpecsDataAdapter`] keeps a local copy of a project's specs fresh:
//! it loads from persistent storage, refreshes from the network with a single
//! in-flight request, and never lets an older result replace a newer one.
//! Rule evaluation consumes the payloads it returns and lives elsewhere.
//!
//! ```ignore
//! let config = Config::load(None)?;
//! let storage = Arc::new(StorageProvider::from_config(&config.storage)?);
//! let adapter = SpecsDataAdapter::new(storage);
//! adapter.attach(&Config::sdk_key_from_env()?, Some(&config), None)?;
//!
//! adapter.warm_from_storage();
//! let specs = adapter.get_data_async(None, &FetchOptions::default()).await;
//! ```

pub mod cache;
pub mod config;
pub mod specs;

pub use cache::{CacheKey, CachedResult, DataSource, FetchOptions, FetchPriority, StorageProvider};
pub use config::Config;
pub use specs::SpecsDataAdapter;
