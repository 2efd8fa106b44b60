mod entities;
mod error;
mod sea_orm_store;
mod store;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use sea_orm_store::SeaOrmStore;
pub use store::{Store, UsageAggregateFilter};
