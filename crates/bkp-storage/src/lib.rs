//! HTTP fetch utilities and the local pass store for bookkeeping synchronization.

mod http;
mod memory;
mod postgres;
mod store;

pub use http::{with_query, ClientIdentity, FetchError, HttpClientConfig, HttpFetcher};
pub use reqwest::Url;
pub use memory::MemoryStore;
pub use postgres::{PgStore, PoolConfig};
pub use store::{PassStore, PassTransaction, StoreError, UpsertOutcome, VersionWatermark};

pub const CRATE_NAME: &str = "bkp-storage";
