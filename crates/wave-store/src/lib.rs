//! Versioned object store for the Wave backend.
//!
//! Objects are addressed by [`ORef`](wave_types::ORef) and carry an
//! optimistic-concurrency `version`. All access goes through a transaction
//! handle ([`Tx`]) which accumulates the [`UpdateSet`](wave_types::UpdateSet)
//! of every mutation it performs, so a caller can hand one coherent batch to
//! the event broker once the transaction commits.
//!
//! # Storage Backends
//!
//! The durable engine is supplied through the [`StorageBackend`] trait:
//!
//! - [`InMemoryBackend`] -- `HashMap`-based backend for tests and embedding
//!
//! # Design Rules
//!
//! 1. `version` strictly increases on every successful update of an oid.
//! 2. An update presenting a stale version fails with `Conflict` and leaves
//!    the stored object untouched.
//! 3. Every store operation inside a transaction closure uses the same
//!    backend transaction; an error rolls all of them back.
//! 4. Updates are published only after commit. A failed scope yields zero
//!    update entries.
//! 5. The store never cascades deletes; orchestrating callers do.

pub mod backend;
pub mod error;
pub mod memory;
pub mod store;

pub use backend::{BackendTxn, StorageBackend};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryBackend;
pub use store::{Tx, WaveStore, DEFAULT_CONFLICT_RETRIES};
