pub mod db;
pub mod domain;

pub use db::{MemoryStore, PgStore, ReconcileOutcome, Store, StoreError};
