pub mod catalog;
pub mod metadata_cache;

pub use catalog::{catalog_key, ReferenceCatalog, ReferenceSource};
pub use metadata_cache::{MetadataCache, DEFAULT_TTL};
