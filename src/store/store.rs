//! The chunk store façade.
//!
//! A [`ChunkStore`] maps 20-byte content addresses to opaque chunks and
//! maintains one mutable root address naming the committed dataset.
//!
//! # Data Flow
//!
//! ```text
//!  put ──► memtable ──full──► persister ──► novel table ─┐
//!                                                        │ commit (CAS)
//!  get ──► memtable ──► novel tables ──► upstream tables ◄┘
//! ```
//!
//! Writes buffer in the memtable until it reaches its byte budget, then the
//! whole buffer becomes one immutable table at the front of the novel list.
//! Reads search the memtable, then novel tables newest first, then the
//! upstream tables named by the manifest.
//!
//! # Commit Protocol
//!
//! `commit(current, last)` advances the root from `last` to `current` and
//! publishes every novel table, using the manifest lock as an optimistic
//! CAS token:
//!
//! 1. With no novel chunks and `current == last`, just rebase and succeed.
//! 2. A memtable above the pre-flush threshold is persisted before the
//!    update lock is taken, so slow flushes do not serialize committers.
//! 3. Under the per-store update lock: fail fast if the cached manifest
//!    already shows a different lock; flush what remains; conjoin if the
//!    table count crossed the limit; then CAS the manifest.
//! 4. A CAS lost to a root move reports failure to the caller, who must
//!    re-plan against the new root. A CAS lost to a table-set change (for
//!    example a competing conjoin) rebases and retries internally.
//!
//! # Locking
//!
//! The state lock guards `(memtable, tables, upstream)`. Readers snapshot
//! under the read side and do their I/O after release; writers hold the
//! write side. The manifest update lock serializes commits per store
//! identity and is always taken before the state lock, never inside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::sync::{mpsc, RwLock};

use super::conjoin::Conjoiner;
use super::manifest::{
    FileManifest, ManifestBackend, ManifestContents, ManifestManager, ObjectManifest, TableSpec,
};
use super::memtable::Memtable;
use super::persist::{FsPersister, ObjectPersister, TablePersister};
use super::table::{to_get_records, to_has_records, ChunkLocation};
use super::tableset::TableSet;
use crate::cache::CacheContext;
use crate::chunk::Chunk;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::hash::Addr;
use crate::stats::Stats;

// Bound on internal retries while concurrent committers keep changing the
// table set. Contention is expected to be brief; hitting this means the
// store is being thrashed.
const MAX_COMMIT_RETRIES: usize = 64;

struct StoreState {
    memtable: Option<Arc<Memtable>>,
    tables: TableSet,
    upstream: ManifestContents,
}

enum UpdateOutcome {
    Committed,
    LastRootMismatch,
    RootChanged,
    TablesChanged,
}

pub struct ChunkStore {
    mm: ManifestManager,
    persister: Arc<dyn TablePersister>,
    conjoiner: Conjoiner,
    state: RwLock<StoreState>,
    memtable_size: u64,
    preflush_chunk_count: usize,
    stats: Stats,
    closed: AtomicBool,
}

impl ChunkStore {
    /// Opens a store backed by one local directory.
    pub async fn open_local(
        dir: impl Into<std::path::PathBuf>,
        config: StoreConfig,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let caches = resolve_caches(&config);
        let backend = Arc::new(FileManifest::new(&dir));
        let persister = Arc::new(FsPersister::new(&dir, &config, caches.clone()));
        Self::open_with(backend, persister, config).await
    }

    /// Opens a store backed by an object store under the given prefix.
    pub async fn open_object(
        store: Arc<dyn ObjectStore>,
        prefix: ObjectPath,
        config: StoreConfig,
    ) -> Result<Self> {
        let caches = resolve_caches(&config);
        let backend = Arc::new(ObjectManifest::new(store.clone(), &prefix));
        let persister = Arc::new(ObjectPersister::new(store, prefix, &config, caches));
        Self::open_with(backend, persister, config).await
    }

    /// Opens a store over explicit backend halves. The manifest is fetched
    /// once; a version mismatch is fatal here.
    pub async fn open_with(
        backend: Arc<dyn ManifestBackend>,
        persister: Arc<dyn TablePersister>,
        config: StoreConfig,
    ) -> Result<Self> {
        let caches = resolve_caches(&config);
        let store = Self {
            mm: ManifestManager::new(backend, caches),
            persister,
            conjoiner: Conjoiner::new(config.max_tables),
            state: RwLock::new(StoreState {
                memtable: None,
                tables: TableSet::new(),
                upstream: ManifestContents::empty(),
            }),
            memtable_size: config.memtable_size_bytes,
            preflush_chunk_count: config.preflush_chunk_count,
            stats: Stats::new(),
            closed: AtomicBool::new(false),
        };

        if let Some(contents) = store.mm.fetch().await? {
            let mut st = store.state.write().await;
            st.tables = st.tables.rebase(&contents.specs, &*store.persister).await?;
            st.upstream = contents;
        }
        Ok(store)
    }

    /// Adds a chunk. A full memtable is persisted synchronously before the
    /// chunk is buffered, so put can block on backend I/O but never drops.
    pub async fn put(&self, chunk: Chunk) -> Result<()> {
        self.ensure_open()?;
        let mut st = self.state.write().await;
        loop {
            let memtable = st
                .memtable
                .get_or_insert_with(|| Arc::new(Memtable::new(self.memtable_size)));
            if memtable.add_chunk(chunk.addr(), chunk.data().clone()) {
                self.stats.record_put();
                return Ok(());
            }
            if let Some(full) = st.memtable.take() {
                self.flush_locked(&mut st, full).await?;
            }
        }
    }

    /// Reads one chunk. Absence is None, not an error.
    pub async fn get(&self, addr: Addr) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let (buffered, tables) = {
            let st = self.state.read().await;
            (st.memtable.as_ref().and_then(|mt| mt.get(&addr)), st.tables.clone())
        };
        if let Some(data) = buffered {
            self.stats.record_get(1);
            return Ok(Some(data));
        }
        let result = tables.get(&addr).await?;
        self.stats.record_get(result.is_some() as u64);
        Ok(result)
    }

    /// Delivers every present chunk of the batch into `sink`, coalescing
    /// physically adjacent table reads. All requests see one consistent
    /// `(memtable, novel, upstream)` snapshot even if a commit lands midway.
    /// Dropping the receiver cancels the batch.
    pub async fn get_many(&self, addrs: &[Addr], sink: &mpsc::Sender<Chunk>) -> Result<()> {
        self.ensure_open()?;
        let mut reqs = to_get_records(addrs);
        self.stats.record_get(reqs.len() as u64);

        let (buffered, tables) = {
            let st = self.state.read().await;
            let buffered = match &st.memtable {
                Some(mt) => mt.get_many(&mut reqs),
                None => Vec::new(),
            };
            (buffered, st.tables.clone())
        };

        for chunk in buffered {
            if sink.send(chunk).await.is_err() {
                return Ok(());
            }
        }
        if reqs.iter().any(|r| !r.found) {
            tables.get_many(&mut reqs, sink).await?;
        }
        Ok(())
    }

    /// Index-only membership check.
    pub async fn has(&self, addr: Addr) -> Result<bool> {
        self.ensure_open()?;
        self.stats.record_has(1);
        let (buffered, tables) = {
            let st = self.state.read().await;
            (st.memtable.as_ref().is_some_and(|mt| mt.has(&addr)), st.tables.clone())
        };
        Ok(buffered || tables.has(&addr))
    }

    /// Returns the subset of `addrs` the store does not hold.
    pub async fn has_many(&self, addrs: &[Addr]) -> Result<Vec<Addr>> {
        self.ensure_open()?;
        let mut reqs = to_has_records(addrs);
        self.stats.record_has(reqs.len() as u64);

        let tables = {
            let st = self.state.read().await;
            if let Some(mt) = &st.memtable {
                mt.has_many(&mut reqs);
            }
            st.tables.clone()
        };
        if reqs.iter().any(|r| !r.has) {
            tables.has_many(&mut reqs);
        }
        Ok(reqs.iter().filter(|r| !r.has).map(|r| r.addr).collect())
    }

    /// Total chunk count across memtable and tables. Chunks duplicated
    /// between tables count per copy until a conjoin merges them.
    pub async fn count(&self) -> Result<u64> {
        self.ensure_open()?;
        let st = self.state.read().await;
        let buffered = st.memtable.as_ref().map_or(0, |mt| mt.count() as u64);
        Ok(buffered + st.tables.count())
    }

    /// The current committed root. Zero means the dataset is empty.
    pub async fn root(&self) -> Result<Addr> {
        self.ensure_open()?;
        let st = self.state.read().await;
        Ok(st.upstream.root)
    }

    /// The storage format version of the manifest this store follows.
    pub async fn version(&self) -> Result<String> {
        self.ensure_open()?;
        let st = self.state.read().await;
        Ok(st.upstream.version.clone())
    }

    /// Pre-flight estimate for a batched get against the current tables:
    /// physical reads needed and whether the batch spans several tables.
    pub async fn calc_reads(&self, addrs: &[Addr], block_size: u64) -> Result<(usize, bool)> {
        self.ensure_open()?;
        let mut reqs = to_get_records(addrs);
        let tables = {
            let st = self.state.read().await;
            st.tables.clone()
        };
        let (reads, split, _) = tables.calc_reads(&mut reqs, block_size);
        Ok((reads, split))
    }

    /// Maps each requested address to the table that holds it and the byte
    /// range of its payload there, searching published tables first. No
    /// payload is read; replication layers use the ranges to fetch table
    /// data directly. Chunks still buffered in the memtable have no
    /// location and are left unresolved.
    pub async fn chunk_locations(
        &self,
        addrs: &[Addr],
    ) -> Result<HashMap<Addr, HashMap<Addr, ChunkLocation>>> {
        self.ensure_open()?;
        let mut reqs = to_get_records(addrs);
        let tables = {
            let st = self.state.read().await;
            st.tables.clone()
        };
        Ok(tables.chunk_locations(&mut reqs))
    }

    /// Streams every chunk in the store into `sink`, oldest tables first
    /// and the memtable last, for replication. Dropping the receiver stops
    /// the stream.
    pub async fn extract_chunks(&self, sink: &mpsc::Sender<Chunk>) -> Result<()> {
        self.ensure_open()?;
        let (tables, memtable) = {
            let st = self.state.read().await;
            (st.tables.clone(), st.memtable.clone())
        };

        for reader in tables.iter_oldest_first() {
            for pos in 0..reader.chunk_count() as usize {
                let chunk = reader.chunk_at(pos).await?;
                if sink.send(chunk).await.is_err() {
                    return Ok(());
                }
            }
        }
        if let Some(mt) = memtable {
            for chunk in mt.extract() {
                if sink.send(chunk).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Reloads the manifest and realigns the table set to it. Novel tables
    /// are preserved.
    pub async fn rebase(&self) -> Result<()> {
        self.ensure_open()?;
        let mut st = self.state.write().await;
        if let Some(contents) = self.mm.fetch().await? {
            st.tables = st.tables.rebase(&contents.specs, &*self.persister).await?;
            st.upstream = contents;
        }
        Ok(())
    }

    /// Attempts to advance the root from `last` to `current`, publishing
    /// all novel chunks. Returns false when a concurrent committer moved
    /// the root first (the caller must re-plan); table-set races are
    /// retried internally.
    pub async fn commit(&self, current: Addr, last: Addr) -> Result<bool> {
        self.ensure_open()?;

        let any_novel = {
            let st = self.state.read().await;
            st.memtable.as_ref().is_some_and(|mt| mt.count() > 0) || st.tables.novel_count() > 0
        };
        if !any_novel && current == last {
            self.rebase().await?;
            return Ok(true);
        }

        {
            // Persisting a big memtable is slow; do it before taking the
            // update lock so other committers are not serialized behind it.
            let mut st = self.state.write().await;
            let oversized = st
                .memtable
                .as_ref()
                .is_some_and(|mt| mt.count() as usize > self.preflush_chunk_count);
            if oversized {
                if let Some(mt) = st.memtable.take() {
                    self.flush_locked(&mut st, mt).await?;
                }
            }
        }

        let _update = self.mm.lock_for_update().await;
        let mut attempts = 0;
        loop {
            let mut st = self.state.write().await;
            match self.update_manifest(&mut st, current, last).await? {
                UpdateOutcome::Committed => {
                    self.stats.record_commit();
                    return Ok(true);
                }
                UpdateOutcome::LastRootMismatch | UpdateOutcome::RootChanged => {
                    return Ok(false);
                }
                UpdateOutcome::TablesChanged => {
                    self.stats.record_commit_retry();
                    attempts += 1;
                    if attempts >= MAX_COMMIT_RETRIES {
                        return Err(Error::IO(format!(
                            "commit abandoned after {MAX_COMMIT_RETRIES} table-set races"
                        )));
                    }
                }
            }
        }
    }

    /// Registers externally persisted tables in the manifest without moving
    /// the root. Returns the manifest contents durable afterwards.
    pub async fn update_manifest_with_tables(
        &self,
        updates: &[TableSpec],
    ) -> Result<ManifestContents> {
        self.ensure_open()?;
        let _update = self.mm.lock_for_update().await;
        let mut st = self.state.write().await;

        let contents = self.mm.fetch().await?.unwrap_or_else(ManifestContents::empty);

        let mut specs = contents.specs.clone();
        let mut added = 0;
        for update in updates {
            if !specs.iter().any(|s| s.addr == update.addr) {
                specs.push(*update);
                added += 1;
            }
        }
        if added == 0 {
            st.tables = st.tables.rebase(&contents.specs, &*self.persister).await?;
            st.upstream = contents.clone();
            return Ok(contents);
        }

        let new_contents = ManifestContents::new(contents.root, specs);
        let stored = self.mm.update(contents.lock, new_contents).await?;
        st.tables = st.tables.rebase(&stored.specs, &*self.persister).await?;
        st.upstream = stored.clone();
        Ok(stored)
    }

    /// One-line summary of the store's visible state.
    pub async fn stats_summary(&self) -> Result<String> {
        self.ensure_open()?;
        let st = self.state.read().await;
        let buffered = st.memtable.as_ref().map_or(0, |mt| mt.count() as u64);
        Ok(format!(
            "root: {}; chunk count: {}; physical bytes: {}",
            st.upstream.root,
            buffered + st.tables.count(),
            st.tables.physical_len()
        ))
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Marks the store terminal. Every later operation fails with
    /// [`Error::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    async fn flush_locked(&self, st: &mut StoreState, memtable: Arc<Memtable>) -> Result<()> {
        if memtable.count() == 0 {
            return Ok(());
        }
        let reader = self.persister.persist(&memtable).await?;
        tracing::info!(table = %reader.addr(), chunks = reader.chunk_count(), "flushed memtable");
        self.stats.record_flush();
        st.tables = st.tables.prepend(reader);
        Ok(())
    }

    async fn update_manifest(
        &self,
        st: &mut StoreState,
        current: Addr,
        last: Addr,
    ) -> Result<UpdateOutcome> {
        if st.upstream.root != last {
            return Ok(UpdateOutcome::LastRootMismatch);
        }

        // Preemptive failure: someone in-process already observed a newer
        // manifest, so the CAS below cannot succeed.
        if let Some(cached) = self.mm.update_will_fail(st.upstream.lock) {
            return self.handle_optimistic_failure(st, cached, last).await;
        }

        if let Some(mt) = st.memtable.take() {
            self.flush_locked(st, mt).await?;
        }

        if self.conjoiner.conjoin_required(&st.tables) {
            let conjoined =
                self.conjoiner.conjoin(&st.upstream, &self.mm, &*self.persister).await?;
            if conjoined.lock != st.upstream.lock {
                self.stats.record_conjoin();
                st.tables = st.tables.rebase(&conjoined.specs, &*self.persister).await?;
                st.upstream = conjoined;
                return Ok(UpdateOutcome::TablesChanged);
            }
            // Nothing mergeable (all weight is novel); publish as-is.
        }

        let specs = st.tables.to_specs();
        let new_contents = ManifestContents::new(current, specs);
        let stored = self.mm.update(st.upstream.lock, new_contents.clone()).await?;

        if stored.lock != new_contents.lock {
            return self.handle_optimistic_failure(st, stored, last).await;
        }

        st.upstream = new_contents;
        st.tables = st.tables.flatten();
        Ok(UpdateOutcome::Committed)
    }

    async fn handle_optimistic_failure(
        &self,
        st: &mut StoreState,
        observed: ManifestContents,
        last: Addr,
    ) -> Result<UpdateOutcome> {
        st.tables = st.tables.rebase(&observed.specs, &*self.persister).await?;
        let outcome = if observed.root != last {
            UpdateOutcome::RootChanged
        } else {
            UpdateOutcome::TablesChanged
        };
        st.upstream = observed;
        Ok(outcome)
    }
}

fn resolve_caches(config: &StoreConfig) -> Arc<CacheContext> {
    config.caches.clone().unwrap_or_else(CacheContext::global)
}
