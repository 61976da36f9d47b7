use wave_types::OType;

use crate::error::StoreResult;

/// Durable key-value engine underneath the object store.
///
/// Keys are `(otype, oid)` pairs and values are opaque encoded objects. The
/// object store never assumes anything about the engine beyond this trait.
pub trait StorageBackend: Send + Sync {
    /// Open a transaction. Every read and write issued through the returned
    /// handle is isolated until [`BackendTxn::commit`].
    fn begin(&self) -> StoreResult<Box<dyn BackendTxn + '_>>;
}

/// One open backend transaction.
///
/// Dropping a transaction without committing must discard its writes.
pub trait BackendTxn: Send {
    fn get(&mut self, otype: OType, oid: &str) -> StoreResult<Option<Vec<u8>>>;

    fn put(&mut self, otype: OType, oid: &str, data: Vec<u8>) -> StoreResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&mut self, otype: OType, oid: &str) -> StoreResult<()>;

    /// All `(oid, data)` pairs of one type, including this transaction's
    /// uncommitted writes.
    fn scan(&mut self, otype: OType) -> StoreResult<Vec<(String, Vec<u8>)>>;

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn rollback(self: Box<Self>);
}
