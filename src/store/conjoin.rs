//! Conjoin compaction.
//!
//! Commits add tables and never remove them, so the table count only grows
//! until it crosses `max_tables`. Conjoin then merges the smallest upstream
//! tables into one, enough of them to bring the count below half of
//! `max_tables`, and publishes the result with a manifest CAS that leaves
//! the root untouched. Losing that CAS is harmless: the merged table is
//! content-addressed and simply goes unreferenced, and the caller rebases
//! onto whatever won.

use super::manifest::{ManifestContents, ManifestManager, TableSpec};
use super::persist::TablePersister;
use super::tableset::TableSet;
use crate::error::Result;

#[derive(Clone, Copy, Debug)]
pub struct Conjoiner {
    max_tables: usize,
}

impl Conjoiner {
    pub fn new(max_tables: usize) -> Self {
        Self { max_tables }
    }

    /// True once the table set has grown enough to warrant merging.
    pub fn conjoin_required(&self, tables: &TableSet) -> bool {
        tables.total_tables() >= self.max_tables
    }

    /// Merges a selection of upstream tables and attempts to publish the
    /// shrunken spec list. Returns the contents that won: the merged list on
    /// CAS success, the competing state on failure (the caller rebases and
    /// may retry), or `upstream` unchanged when there is nothing to merge.
    pub async fn conjoin(
        &self,
        upstream: &ManifestContents,
        mm: &ManifestManager,
        persister: &dyn TablePersister,
    ) -> Result<ManifestContents> {
        let (selected, kept) = self.select(&upstream.specs);
        if selected.len() < 2 {
            return Ok(upstream.clone());
        }

        let mut sources = Vec::with_capacity(selected.len());
        for spec in &selected {
            sources.push(persister.open(*spec).await?);
        }
        let merged = persister.conjoin_all(&sources).await?;

        let mut specs =
            vec![TableSpec { addr: merged.addr(), chunk_count: merged.chunk_count() }];
        specs.extend(kept);

        let new_contents = ManifestContents::new(upstream.root, specs);
        let stored = mm.update(upstream.lock, new_contents.clone()).await?;

        if stored.lock == new_contents.lock {
            tracing::info!(
                merged = %merged.addr(),
                inputs = selected.len(),
                upstream_tables = new_contents.specs.len(),
                "conjoined tables"
            );
            Ok(new_contents)
        } else {
            // Lost the race. The merged table is orphaned but safe to leave.
            tracing::warn!(merged = %merged.addr(), "conjoin lost manifest race");
            Ok(stored)
        }
    }

    /// Picks the smallest tables by chunk count, enough to bring the total
    /// below half of `max_tables`, preferring older tables on ties. Returns
    /// the selection in read-priority order and the surviving specs in
    /// their original order.
    fn select(&self, specs: &[TableSpec]) -> (Vec<TableSpec>, Vec<TableSpec>) {
        if specs.len() < 2 {
            return (Vec::new(), specs.to_vec());
        }

        let threshold = (self.max_tables / 2).max(2);
        // Merging n tables leaves len - n + 1; solve for len - n + 1 < threshold.
        let need = specs.len() + 2 - threshold.min(specs.len() + 1);
        let need = need.clamp(2, specs.len());

        // Upstream order is newest first, so larger indexes are older.
        let mut by_size: Vec<usize> = (0..specs.len()).collect();
        by_size.sort_by_key(|&i| (specs[i].chunk_count, std::cmp::Reverse(i)));

        let mut chosen: Vec<usize> = by_size[..need].to_vec();
        chosen.sort_unstable();

        let selected = chosen.iter().map(|&i| specs[i]).collect();
        let kept = (0..specs.len())
            .filter(|i| !chosen.contains(i))
            .map(|i| specs[i])
            .collect();
        (selected, kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheContext;
    use crate::config::StoreConfig;
    use crate::hash::Addr;
    use crate::store::manifest::{ManifestBackend, MemoryManifest};
    use crate::store::memtable::Memtable;
    use crate::store::persist::FsPersister;
    use crate::tmpfs::TempDir;
    use bytes::Bytes;
    use std::sync::Arc;

    fn spec(n: u8, chunk_count: u32) -> TableSpec {
        TableSpec { addr: Addr::of(&[n]), chunk_count }
    }

    #[test]
    fn test_select_prefers_smallest() {
        let conjoiner = Conjoiner::new(8);
        // 6 tables, threshold 4: merging must leave fewer than 4, so 4 are
        // selected.
        let specs = vec![
            spec(0, 50),
            spec(1, 5),
            spec(2, 40),
            spec(3, 10),
            spec(4, 1),
            spec(5, 7),
        ];
        let (selected, kept) = conjoiner.select(&specs);
        assert_eq!(selected.len(), 4);
        let mut counts: Vec<u32> = selected.iter().map(|s| s.chunk_count).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 5, 7, 10]);
        assert_eq!(kept.len(), 2);
        // Survivors keep their order.
        assert_eq!(kept[0].chunk_count, 50);
        assert_eq!(kept[1].chunk_count, 40);
    }

    #[test]
    fn test_select_breaks_ties_older_first() {
        let conjoiner = Conjoiner::new(64);
        // All equal: with threshold 32 and 4 tables, 2 must merge, and the
        // older (higher index) ones are taken.
        let specs = vec![spec(0, 5), spec(1, 5), spec(2, 5), spec(3, 5)];
        let (selected, _) = conjoiner.select(&specs);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].addr, specs[2].addr);
        assert_eq!(selected[1].addr, specs[3].addr);
    }

    #[test]
    fn test_select_single_table_is_noop() {
        let conjoiner = Conjoiner::new(4);
        let specs = vec![spec(0, 5)];
        let (selected, kept) = conjoiner.select(&specs);
        assert!(selected.is_empty());
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_conjoin_required_counts_all_tables() {
        let conjoiner = Conjoiner::new(2);
        assert!(!conjoiner.conjoin_required(&TableSet::new()));
    }

    async fn upstream_of(
        persister: &FsPersister,
        mm: &ManifestManager,
        groups: &[&[&str]],
    ) -> ManifestContents {
        let mut specs = Vec::new();
        for group in groups {
            let mt = Memtable::new(1 << 20);
            for text in *group {
                let data = Bytes::from(text.as_bytes().to_vec());
                mt.add_chunk(Addr::of(&data), data);
            }
            let reader = persister.persist(&mt).await.unwrap();
            specs.insert(
                0,
                TableSpec { addr: reader.addr(), chunk_count: reader.chunk_count() },
            );
        }
        let contents = ManifestContents::new(Addr::of(b"root"), specs);
        let stored = mm.update(Addr::ZERO, contents.clone()).await.unwrap();
        assert_eq!(stored, contents);
        contents
    }

    #[tokio::test]
    async fn test_conjoin_merges_and_publishes() {
        let dir = TempDir::new().unwrap();
        let caches = CacheContext::new(1 << 20, 1 << 20, 16);
        let persister = FsPersister::new(dir.path(), &StoreConfig::default(), caches.clone());
        let backend = MemoryManifest::new("conjoin-test");
        let mm = ManifestManager::new(Arc::new(backend.clone()), caches);

        let upstream = upstream_of(
            &persister,
            &mm,
            &[&["a1", "a2"], &["b1"], &["c1", "c2", "c3"], &["d1"]],
        )
        .await;
        assert_eq!(upstream.specs.len(), 4);

        // max_tables 4 gives threshold 2: everything merges into one table.
        let conjoiner = Conjoiner::new(4);
        let result = conjoiner.conjoin(&upstream, &mm, &persister).await.unwrap();

        assert_eq!(result.specs.len(), 1);
        assert_eq!(result.root, upstream.root);
        assert_eq!(result.specs[0].chunk_count, 7);

        // The merged manifest is durable and the merged table readable.
        let fetched = backend.fetch().await.unwrap().unwrap();
        assert_eq!(fetched, result);
        let merged = persister.open(result.specs[0]).await.unwrap();
        for text in ["a1", "a2", "b1", "c1", "c2", "c3", "d1"] {
            assert!(merged.has(&Addr::of(text.as_bytes())), "missing {text}");
        }
    }

    #[tokio::test]
    async fn test_conjoin_lost_race_returns_observed() {
        let dir = TempDir::new().unwrap();
        let caches = CacheContext::new(1 << 20, 1 << 20, 16);
        let persister = FsPersister::new(dir.path(), &StoreConfig::default(), caches.clone());
        let backend = MemoryManifest::new("conjoin-race");
        let mm = ManifestManager::new(Arc::new(backend.clone()), caches);

        let upstream = upstream_of(&persister, &mm, &[&["a"], &["b"], &["c"], &["d"]]).await;

        // Another writer moves the manifest before the conjoin CAS lands.
        let winner = ManifestContents::new(Addr::of(b"other root"), upstream.specs.clone());
        backend.update(upstream.lock, winner.clone()).await.unwrap();

        let conjoiner = Conjoiner::new(4);
        let result = conjoiner.conjoin(&upstream, &mm, &persister).await.unwrap();
        assert_eq!(result, winner);
    }
}
