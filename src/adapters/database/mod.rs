//! Database abstraction layer
//!
//! Trait-based persistence seams so the pipeline runs against PostgreSQL in
//! production and against [`crate::adapters::memory::MemoryStore`] in tests.

pub mod factory;
pub mod traits;

pub use factory::Repositories;
pub use traits::{ExportLedger, InstanceRepository, MappingRepository};
