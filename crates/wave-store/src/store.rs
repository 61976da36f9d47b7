use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use wave_types::{
    is_valid_oid, MetaMap, ORef, OType, Tab, UpdateEntry, UpdateSet, WaveObj, WaveObjType, Window,
    Workspace,
};

use crate::backend::{BackendTxn, StorageBackend};
use crate::error::{StoreError, StoreResult};
use crate::memory::InMemoryBackend;

/// Attempts made by [`WaveStore::update_with_retry`] callers that have no
/// better number.
pub const DEFAULT_CONFLICT_RETRIES: usize = 3;

/// Versioned object store over a pluggable [`StorageBackend`].
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct WaveStore {
    backend: Arc<dyn StorageBackend>,
}

impl WaveStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    /// Run `f` inside one backend transaction.
    ///
    /// Any error returned by `f` rolls the transaction back; success commits
    /// it. Update entries recorded by `f` are discarded.
    pub fn with_transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Tx<'_>) -> StoreResult<T>,
    {
        self.run(None, f).map(|(value, _)| value)
    }

    /// Like [`with_transaction`](Self::with_transaction), failing with
    /// [`StoreError::Timeout`] once `deadline` passes.
    pub fn with_transaction_deadline<T, F>(&self, deadline: Instant, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Tx<'_>) -> StoreResult<T>,
    {
        self.run(Some(deadline), f).map(|(value, _)| value)
    }

    /// Run `f` inside one transaction and return every update it recorded.
    ///
    /// The set is only returned after a successful commit; on any error the
    /// caller receives no entries at all.
    pub fn with_update_context<T, F>(&self, f: F) -> StoreResult<(T, UpdateSet)>
    where
        F: FnOnce(&mut Tx<'_>) -> StoreResult<T>,
    {
        self.run(None, f)
    }

    pub fn with_update_context_deadline<T, F>(
        &self,
        deadline: Option<Instant>,
        f: F,
    ) -> StoreResult<(T, UpdateSet)>
    where
        F: FnOnce(&mut Tx<'_>) -> StoreResult<T>,
    {
        self.run(deadline, f)
    }

    fn run<T, F>(&self, deadline: Option<Instant>, f: F) -> StoreResult<(T, UpdateSet)>
    where
        F: FnOnce(&mut Tx<'_>) -> StoreResult<T>,
    {
        let mut tx = Tx {
            inner: self.backend.begin()?,
            updates: UpdateSet::new(),
            deadline,
        };
        let result = f(&mut tx).and_then(|value| tx.check_deadline().map(|_| value));
        let Tx { inner, updates, .. } = tx;
        match result {
            Ok(value) => {
                inner.commit()?;
                Ok((value, updates))
            }
            Err(e) => {
                inner.rollback();
                debug!(error = %e, discarded = updates.len(), "transaction rolled back");
                Err(e)
            }
        }
    }

    /// Re-read, mutate and write back one object, retrying on conflict.
    ///
    /// `mutate` runs against a fresh copy on every attempt, so it must be
    /// safe to call more than once. Non-conflict errors are returned
    /// immediately; the last conflict is returned once `max_attempts` runs
    /// out.
    pub fn update_with_retry<T, F>(
        &self,
        oid: &str,
        max_attempts: usize,
        mut mutate: F,
    ) -> StoreResult<(T, UpdateSet)>
    where
        T: WaveObjType,
        F: FnMut(&mut T) -> StoreResult<()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.with_update_context(|tx| {
                let mut obj = tx.must_get::<T>(oid)?;
                mutate(&mut obj)?;
                tx.update(obj)
            });
            match result {
                Err(e) if e.is_conflict() && attempt < max_attempts.max(1) => {
                    debug!(otype = %T::OTYPE, oid, attempt, error = %e, "retrying after conflict");
                }
                other => return other,
            }
        }
    }

    pub fn get<T: WaveObjType>(&self, oid: &str) -> StoreResult<Option<T>> {
        self.with_transaction(|tx| tx.get::<T>(oid))
    }

    pub fn get_obj(&self, oref: &ORef) -> StoreResult<Option<WaveObj>> {
        self.with_transaction(|tx| tx.get_obj(oref))
    }

    pub fn must_get<T: WaveObjType>(&self, oid: &str) -> StoreResult<T> {
        self.with_transaction(|tx| tx.must_get::<T>(oid))
    }

    pub fn must_get_obj(&self, oref: &ORef) -> StoreResult<WaveObj> {
        self.with_transaction(|tx| tx.must_get_obj(oref))
    }

    pub fn get_singleton<T: WaveObjType>(&self) -> StoreResult<T> {
        self.with_transaction(|tx| tx.get_singleton::<T>())
    }

    pub fn get_all<T: WaveObjType>(&self) -> StoreResult<Vec<T>> {
        self.with_transaction(|tx| tx.get_all::<T>())
    }

    pub fn count(&self, otype: OType) -> StoreResult<usize> {
        self.with_transaction(|tx| tx.count(otype))
    }

    pub fn insert<T: WaveObjType>(&self, obj: T) -> StoreResult<T> {
        self.with_transaction(|tx| tx.insert(obj))
    }

    pub fn update<T: WaveObjType>(&self, obj: T) -> StoreResult<T> {
        self.with_transaction(|tx| tx.update(obj))
    }

    pub fn delete(&self, oref: &ORef) -> StoreResult<()> {
        self.with_transaction(|tx| tx.delete(oref))
    }
}

impl std::fmt::Debug for WaveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaveStore").finish_non_exhaustive()
    }
}

/// Handle to one open store transaction.
///
/// Every mutation records an [`UpdateEntry`] in the handle's accumulator.
/// Functions that mutate the store take `&mut Tx` so that the accumulator is
/// passed explicitly down the call chain.
pub struct Tx<'a> {
    inner: Box<dyn BackendTxn + 'a>,
    updates: UpdateSet,
    deadline: Option<Instant>,
}

impl<'a> Tx<'a> {
    fn check_deadline(&self) -> StoreResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StoreError::Timeout),
            _ => Ok(()),
        }
    }

    fn read_obj(&mut self, oref: &ORef) -> StoreResult<Option<WaveObj>> {
        self.check_deadline()?;
        let Some(data) = self.inner.get(oref.otype, &oref.oid)? else {
            return Ok(None);
        };
        let obj: WaveObj = serde_json::from_slice(&data)?;
        if obj.otype() != oref.otype || obj.oid() != oref.oid {
            return Err(StoreError::Storage(format!(
                "row {oref} holds {}",
                obj.oref()
            )));
        }
        Ok(Some(obj))
    }

    fn write_obj(&mut self, obj: &WaveObj) -> StoreResult<()> {
        self.check_deadline()?;
        let data = serde_json::to_vec(obj)?;
        self.inner.put(obj.otype(), obj.oid(), data)
    }

    /// Updates recorded so far in this transaction.
    pub fn updates(&self) -> &UpdateSet {
        &self.updates
    }

    /// Run `f` against this same transaction.
    ///
    /// Nested scopes are flattened: entries recorded by `f` land in this
    /// transaction's accumulator. An error from `f` must be propagated so the
    /// enclosing transaction rolls back.
    pub fn with_update_context<T, F>(&mut self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Tx<'a>) -> StoreResult<T>,
    {
        f(self)
    }

    pub fn get_obj(&mut self, oref: &ORef) -> StoreResult<Option<WaveObj>> {
        self.read_obj(oref)
    }

    pub fn must_get_obj(&mut self, oref: &ORef) -> StoreResult<WaveObj> {
        self.read_obj(oref)?
            .ok_or_else(|| StoreError::NotFound(oref.clone()))
    }

    pub fn get<T: WaveObjType>(&mut self, oid: &str) -> StoreResult<Option<T>> {
        let oref = ORef::new(T::OTYPE, oid);
        match self.read_obj(&oref)? {
            Some(obj) => typed(obj).map(Some),
            None => Ok(None),
        }
    }

    pub fn must_get<T: WaveObjType>(&mut self, oid: &str) -> StoreResult<T> {
        self.get::<T>(oid)?
            .ok_or_else(|| StoreError::NotFound(ORef::new(T::OTYPE, oid)))
    }

    pub fn get_all_obj(&mut self, otype: OType) -> StoreResult<Vec<WaveObj>> {
        self.check_deadline()?;
        self.inner
            .scan(otype)?
            .into_iter()
            .map(|(_, data)| serde_json::from_slice::<WaveObj>(&data).map_err(StoreError::from))
            .collect()
    }

    pub fn get_all<T: WaveObjType>(&mut self) -> StoreResult<Vec<T>> {
        self.get_all_obj(T::OTYPE)?.into_iter().map(typed).collect()
    }

    pub fn count(&mut self, otype: OType) -> StoreResult<usize> {
        self.check_deadline()?;
        Ok(self.inner.scan(otype)?.len())
    }

    /// The unique instance of a singleton type.
    pub fn get_singleton<T: WaveObjType>(&mut self) -> StoreResult<T> {
        if !T::OTYPE.is_singleton() {
            return Err(StoreError::InvalidObject {
                oref: ORef::new(T::OTYPE, "*"),
                reason: "type is not a singleton".into(),
            });
        }
        let mut all = self.get_all::<T>()?;
        match all.len() {
            0 => Err(StoreError::NotFound(ORef::new(T::OTYPE, "*"))),
            1 => Ok(all.remove(0)),
            n => Err(StoreError::Storage(format!(
                "{n} instances of singleton type {}",
                T::OTYPE
            ))),
        }
    }

    /// Store a new object at version 1.
    pub fn insert<T: WaveObjType>(&mut self, obj: T) -> StoreResult<T> {
        typed(self.insert_obj(obj.into_obj())?)
    }

    pub fn insert_obj(&mut self, mut obj: WaveObj) -> StoreResult<WaveObj> {
        let oref = obj.oref();
        if !is_valid_oid(&oref.oid) {
            return Err(StoreError::InvalidObject {
                oref,
                reason: "invalid oid".into(),
            });
        }
        if self.read_obj(&oref)?.is_some() {
            return Err(StoreError::AlreadyExists(oref));
        }
        obj.set_version(1);
        self.write_obj(&obj)?;
        self.updates.push(UpdateEntry::update(obj.clone()));
        Ok(obj)
    }

    /// Write back a modified copy. The copy's version must equal the stored
    /// version; the returned object carries the incremented version.
    pub fn update<T: WaveObjType>(&mut self, obj: T) -> StoreResult<T> {
        typed(self.update_obj(obj.into_obj())?)
    }

    pub fn update_obj(&mut self, mut obj: WaveObj) -> StoreResult<WaveObj> {
        let oref = obj.oref();
        let stored = self
            .read_obj(&oref)?
            .ok_or_else(|| StoreError::NotFound(oref.clone()))?;
        if stored.version() != obj.version() {
            return Err(StoreError::Conflict {
                oref,
                presented: obj.version(),
                stored: stored.version(),
            });
        }
        obj.set_version(stored.version() + 1);
        self.write_obj(&obj)?;
        self.updates.push(UpdateEntry::update(obj.clone()));
        Ok(obj)
    }

    /// Remove an object. Removing an absent object is not an error; a
    /// delete entry is recorded either way.
    pub fn delete(&mut self, oref: &ORef) -> StoreResult<()> {
        self.check_deadline()?;
        self.inner.delete(oref.otype, &oref.oid)?;
        self.updates.push(UpdateEntry::delete(oref));
        Ok(())
    }

    /// Merge `update` into the object's meta and write it back.
    pub fn update_meta(
        &mut self,
        oref: &ORef,
        update: &MetaMap,
        merge_special: bool,
    ) -> StoreResult<WaveObj> {
        let mut obj = self.must_get_obj(oref)?;
        let merged = obj.meta().merged(update, merge_special);
        *obj.meta_mut() = merged;
        self.update_obj(obj)
    }

    pub fn find_tab_for_block(&mut self, block_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .get_all::<Tab>()?
            .into_iter()
            .find(|tab| tab.block_ids.iter().any(|id| id == block_id))
            .map(|tab| tab.oid))
    }

    pub fn find_workspace_for_tab(&mut self, tab_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .get_all::<Workspace>()?
            .into_iter()
            .find(|ws| ws.tab_ids.iter().any(|id| id == tab_id))
            .map(|ws| ws.oid))
    }

    pub fn find_window_for_workspace(&mut self, workspace_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .get_all::<Window>()?
            .into_iter()
            .find(|win| win.workspace_id == workspace_id)
            .map(|win| win.oid))
    }

    pub fn find_window_for_tab(&mut self, tab_id: &str) -> StoreResult<Option<String>> {
        match self.find_workspace_for_tab(tab_id)? {
            Some(ws) => self.find_window_for_workspace(&ws),
            None => Ok(None),
        }
    }
}

fn typed<T: WaveObjType>(obj: WaveObj) -> StoreResult<T> {
    let oref = obj.oref();
    T::from_obj(obj).ok_or_else(|| StoreError::InvalidObject {
        oref,
        reason: format!("expected otype {}", T::OTYPE),
    })
}
