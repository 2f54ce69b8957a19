//! # Checkpointing Key-Value Store
//!
//! A single-writer key-value store layered on an append-only record log.
//!
//! ## Core Concepts
//!
//! - **Record log**: ordered, immutable records numbered from 1
//! - **Updates**: one record per write, mapping keys to values or tombstones
//! - **Checkpoints**: leveled snapshots (like `dump` levels 0-9) written every
//!   few records, letting lookups skip whole ranges of history
//!
//! ## Example
//!
//! ```ignore
//! use checkpoint_kv::{Store, StoreConfig};
//!
//! let mut store = Store::open_or_create(StoreConfig {
//!     path: "./my-store".into(),
//!     ..Default::default()
//! })?;
//!
//! store.set("greeting", "hello")?;
//! assert_eq!(store.get("greeting")?, Some(b"hello".to_vec()));
//!
//! store.delete("greeting")?;
//! assert_eq!(store.get("greeting")?, None);
//! ```

pub mod cache;
pub mod codec;
pub mod error;
pub mod records;
pub mod shared;
pub mod store;
pub mod types;

// Re-exports
pub use cache::CachePolicy;
pub use error::{Result, StoreError};
pub use records::{FileLog, MemoryLog, RecordLog};
pub use shared::SharedStore;
pub use store::{Store, StoreConfig, DEFAULT_CHECKPOINT_FREQ, DEFAULT_MERGE_THRESHOLD};
pub use types::*;
