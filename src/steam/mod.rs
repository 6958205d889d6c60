pub mod catalog;
pub mod filter;
pub mod http;
pub mod models;
pub mod prices;
pub mod regions;

#[cfg(test)]
pub(crate) mod testing;

pub use http::{ReqwestTransport, RetryingClient, StoreTransport};
pub use models::{CatalogEntry, EntryPriceProfile, PriceAccumulator, Region, RegionPriceRecord};
