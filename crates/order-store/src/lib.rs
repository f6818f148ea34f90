//! Local persistence for the checkout saga.
//!
//! Two stores live here:
//! - [`OrderStore`]: the order row, its items and its saga steps, each write
//!   applied atomically.
//! - [`CompensationLog`]: the append-only record of reversible steps that
//!   drives rollback and crash recovery.
//!
//! Both come with an in-memory implementation for tests and a PostgreSQL
//! implementation built on `sqlx`.

pub mod compensation;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use compensation::{CompensationLog, CompensationLogEntry, CompensationLogExt};
pub use error::{Result, StoreError};
pub use memory::{InMemoryCompensationLog, InMemoryOrderStore};
pub use postgres::{PostgresCompensationLog, PostgresOrderStore};
pub use store::OrderStore;
