//! Ordered, lock-guarded file list of one partition lane

use super::TsFileResource;
use crate::Lane;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Files of one lane ordered by version (oldest first).
///
/// The lock is the single serialisation point for the set of files: queries
/// and selectors take it shared, flush and compaction swaps take it
/// exclusively.
#[derive(Debug)]
pub struct TsFileResourceList {
    lane: Lane,
    files: RwLock<Vec<Arc<TsFileResource>>>,
}

impl TsFileResourceList {
    pub fn new(lane: Lane) -> Self {
        Self {
            lane,
            files: RwLock::new(Vec::new()),
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn read(&self) -> ResourceListReadGuard<'_> {
        ResourceListReadGuard {
            files: self.files.read(),
        }
    }

    pub fn write(&self) -> ResourceListWriteGuard<'_> {
        ResourceListWriteGuard {
            files: self.files.write(),
        }
    }

    /// Insert keeping version order
    pub fn insert(&self, resource: Arc<TsFileResource>) {
        self.write().insert(resource);
    }

    /// Remove a resource; returns false if it was not present
    pub fn remove(&self, resource: &Arc<TsFileResource>) -> bool {
        self.write().remove(resource)
    }

    /// Pinned copy of the current files
    pub fn snapshot(&self) -> Vec<Arc<TsFileResource>> {
        self.files.read().clone()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

/// Shared view of a list
pub struct ResourceListReadGuard<'a> {
    files: RwLockReadGuard<'a, Vec<Arc<TsFileResource>>>,
}

impl<'a> ResourceListReadGuard<'a> {
    /// Oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<TsFileResource>> + '_ {
        self.files.iter()
    }

    /// Newest to oldest
    pub fn reverse_iter(&self) -> impl Iterator<Item = &Arc<TsFileResource>> + '_ {
        self.files.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<TsFileResource>> {
        self.files.clone()
    }
}

/// Exclusive view of a list
pub struct ResourceListWriteGuard<'a> {
    files: RwLockWriteGuard<'a, Vec<Arc<TsFileResource>>>,
}

impl<'a> ResourceListWriteGuard<'a> {
    pub fn insert(&mut self, resource: Arc<TsFileResource>) {
        let position = self
            .files
            .partition_point(|r| r.version() <= resource.version());
        self.files.insert(position, resource);
    }

    pub fn remove(&mut self, resource: &Arc<TsFileResource>) -> bool {
        match self.files.iter().position(|r| Arc::ptr_eq(r, resource)) {
            Some(index) => {
                self.files.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, resource: &Arc<TsFileResource>) -> bool {
        self.files.iter().any(|r| Arc::ptr_eq(r, resource))
    }

    /// Swap `sources` for `targets`.
    ///
    /// A target is named after one of its sources, so inserting by version
    /// puts it back in the slot the sources occupied.
    pub fn replace(&mut self, sources: &[Arc<TsFileResource>], targets: Vec<Arc<TsFileResource>>) {
        self.files
            .retain(|r| !sources.iter().any(|s| Arc::ptr_eq(r, s)));
        for target in targets {
            self.insert(target);
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<TsFileResource>> {
        self.files.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::MemTable;
    use crate::tsfile::TsFileName;
    use tempfile::tempdir;

    fn resource(dir: &std::path::Path, version: u64, level: u32) -> Arc<TsFileResource> {
        let path = dir.join(TsFileName::new(version, level).file_name());
        Arc::new(
            TsFileResource::open_new(path, Lane::Sequence, Arc::new(MemTable::new(version)))
                .unwrap(),
        )
    }

    fn versions(list: &TsFileResourceList) -> Vec<(u64, u32)> {
        list.read()
            .iter()
            .map(|r| (r.version(), r.level()))
            .collect()
    }

    #[test]
    fn test_insert_keeps_version_order() {
        let dir = tempdir().unwrap();
        let list = TsFileResourceList::new(Lane::Sequence);
        for v in [3, 1, 2] {
            list.insert(resource(dir.path(), v, 0));
        }

        assert_eq!(versions(&list), vec![(1, 0), (2, 0), (3, 0)]);
        let newest_first: Vec<_> = list.read().reverse_iter().map(|r| r.version()).collect();
        assert_eq!(newest_first, vec![3, 2, 1]);
    }

    #[test]
    fn test_replace_run_in_place() {
        let dir = tempdir().unwrap();
        let list = TsFileResourceList::new(Lane::Unsequence);
        let files: Vec<_> = (1..=5).map(|v| resource(dir.path(), v, 0)).collect();
        for f in &files {
            list.insert(Arc::clone(f));
        }

        let target = resource(dir.path(), 4, 1);
        list.write().replace(&files[1..4], vec![target]);
        assert_eq!(versions(&list), vec![(1, 0), (4, 1), (5, 0)]);

        let seq_target = resource(dir.path(), 5, 1);
        list.write().replace(&files[4..5], vec![seq_target]);
        assert_eq!(versions(&list), vec![(1, 0), (4, 1), (5, 1)]);

        assert!(list.remove(&files[0]));
        assert!(!list.remove(&files[0]));
        assert_eq!(list.len(), 2);
    }
}
