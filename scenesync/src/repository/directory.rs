//! Directory nodes of the mirrored tree and the per-directory diff.
//!
//! Nodes live in a [`DirArena`] owned by the engine. A [`DirId`] carries the
//! slot generation it was issued for, so a request or task that outlives its
//! directory (removed upstream mid-sync) resolves to `None` instead of an
//! unrelated node that reused the slot.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::hash_cache::HashCache;
use super::index::{DirectoryIndex, DirectoryIndexEntry, EntryType, INDEX_FILE_NAME};
use crate::hash;

/// Generation-checked handle to a directory in a [`DirArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId {
    index: u32,
    generation: u32,
}

/// One directory of the mirrored tree.
#[derive(Debug)]
pub struct HttpDirectory {
    /// Path relative to the repository root; empty for the root.
    pub relative_path: String,
    pub parent: Option<DirId>,
    pub children: Vec<DirId>,
    pub hash_cache: HashCache,
    /// Hash of this directory's index as announced by the parent.
    pub expected_index_hash: String,
}

impl HttpDirectory {
    /// Create a node, loading its hash cache from `fs_base`.
    pub fn new(fs_base: &Path, relative_path: String, parent: Option<DirId>) -> Self {
        let hash_cache = HashCache::load(&local_path(fs_base, &relative_path));
        Self {
            relative_path,
            parent,
            children: Vec::new(),
            hash_cache,
            expected_index_hash: String::new(),
        }
    }

    /// Last path segment; empty for the root.
    pub fn name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// Location of this directory under `fs_base`.
    pub fn local_path(&self, fs_base: &Path) -> PathBuf {
        local_path(fs_base, &self.relative_path)
    }

    /// Repository-relative path of child `name`.
    pub fn child_path(&self, name: &str) -> String {
        join_relative(&self.relative_path, name)
    }
}

/// Join two repository-relative paths.
pub fn join_relative(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// Map a repository-relative path onto the local tree.
pub fn local_path(fs_base: &Path, relative: &str) -> PathBuf {
    let mut path = fs_base.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<HttpDirectory>,
}

/// Slot arena of directory nodes.
#[derive(Debug, Default)]
pub struct DirArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl DirArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: HttpDirectory) -> DirId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            DirId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            DirId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    pub fn get(&self, id: DirId) -> Option<&HttpDirectory> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub fn get_mut(&mut self, id: DirId) -> Option<&mut HttpDirectory> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, id: DirId) -> bool {
        self.get(id).is_some()
    }

    /// Remove `id` and all its descendants, returning the removed ids.
    ///
    /// The node is also unlinked from its parent's child list.
    pub fn remove_subtree(&mut self, id: DirId) -> Vec<DirId> {
        let parent = self.get(id).and_then(|node| node.parent);
        if let Some(parent) = parent.and_then(|p| self.get_mut(p)) {
            parent.children.retain(|child| *child != id);
        }

        let mut removed = Vec::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let Some(slot) = self.slots.get_mut(current.index as usize) else {
                continue;
            };
            if slot.generation != current.generation {
                continue;
            }
            if let Some(node) = slot.node.take() {
                pending.extend(node.children);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(current.index);
                removed.push(current);
            }
        }
        removed
    }

    /// Child of `parent` whose last segment is `name`.
    pub fn find_child(&self, parent: DirId, name: &str) -> Option<DirId> {
        let node = self.get(parent)?;
        node.children
            .iter()
            .copied()
            .find(|child| self.get(*child).is_some_and(|c| c.name() == name))
    }

    /// Ids of all live nodes.
    pub fn ids(&self) -> Vec<DirId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.node.is_some())
            .map(|(index, slot)| DirId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Live node for a repository-relative path.
    pub fn find_by_path(&self, relative_path: &str) -> Option<DirId> {
        self.ids()
            .into_iter()
            .find(|id| self.get(*id).is_some_and(|d| d.relative_path == relative_path))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decision taken for one child during a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Add,
    Update,
    Delete,
    UpToDate,
}

/// One diff decision, offered to the sync filter before it is acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItem {
    /// Repository-relative path of the containing directory.
    pub directory: String,
    pub entry_type: EntryType,
    pub filename: String,
    pub action: SyncAction,
    pub path_on_disk: PathBuf,
}

impl SyncItem {
    /// Repository-relative path of the item itself.
    pub fn relative_path(&self) -> String {
        join_relative(&self.directory, &self.filename)
    }
}

/// What is currently on disk for a child name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalKind {
    File,
    Directory,
}

/// A sync item paired with the data needed to act on it.
#[derive(Debug, Clone)]
pub(crate) struct PlannedItem {
    pub item: SyncItem,
    /// Manifest entry; `None` for deletions.
    pub entry: Option<DirectoryIndexEntry>,
    /// What currently occupies the name on disk.
    pub local: Option<LocalKind>,
}

impl PlannedItem {
    /// Whether the local object has the wrong type and must be removed first.
    pub fn needs_type_change(&self) -> bool {
        match (&self.entry, self.local) {
            (Some(entry), Some(local)) => match entry.entry_type {
                EntryType::File => local == LocalKind::Directory,
                EntryType::Directory => local == LocalKind::File,
                EntryType::Tarball => false,
            },
            _ => false,
        }
    }
}

/// Directory an archive named `name` is extracted into.
pub fn tarball_stem(name: &str) -> &str {
    const SUFFIXES: [&str; 6] = [".tar.gz", ".tar.xz", ".tgz", ".txz", ".tar", ".zip"];
    let lower = name.to_ascii_lowercase();
    for suffix in SUFFIXES {
        if lower.ends_with(suffix) && name.len() > suffix.len() {
            return &name[..name.len() - suffix.len()];
        }
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    }
}

/// Non-hidden children currently on disk; a missing directory is empty.
pub(crate) fn list_local_children(path: &Path) -> io::Result<Vec<(String, LocalKind)>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut children = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            warn!(path = %entry.path().display(), "Ignoring non UTF-8 file name");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let kind = if entry.file_type()?.is_dir() {
            LocalKind::Directory
        } else {
            LocalKind::File
        };
        children.push((name, kind));
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(children)
}

/// Hash of the index saved in `dir`, if any.
pub(crate) fn saved_index_hash(dir: &Path) -> Option<String> {
    hash::hash_file(&dir.join(INDEX_FILE_NAME)).ok()
}

/// Diff `index` against the local contents of `dir_path`.
///
/// Deletions come first, then the index entries in index order. File hashes
/// are taken from `cache` where still valid and refreshed otherwise.
pub(crate) fn compute_sync_items(
    dir_relative: &str,
    dir_path: &Path,
    index: &DirectoryIndex,
    cache: &mut HashCache,
) -> io::Result<Vec<PlannedItem>> {
    let local = list_local_children(dir_path)?;
    let local_kind = |name: &str| {
        local
            .iter()
            .find(|(local_name, _)| local_name == name)
            .map(|(_, kind)| *kind)
    };
    let item = |entry_type, filename: &str, action| SyncItem {
        directory: dir_relative.to_string(),
        entry_type,
        filename: filename.to_string(),
        action,
        path_on_disk: dir_path.join(filename),
    };

    let mut planned = Vec::new();

    for (name, kind) in &local {
        let named = index.find(name).is_some();
        let is_stem = index.entries.iter().any(|e| {
            e.entry_type == EntryType::Tarball && tarball_stem(&e.name) == name.as_str()
        });
        if named || is_stem {
            continue;
        }
        let entry_type = match kind {
            LocalKind::File => EntryType::File,
            LocalKind::Directory => EntryType::Directory,
        };
        planned.push(PlannedItem {
            item: item(entry_type, name, SyncAction::Delete),
            entry: None,
            local: Some(*kind),
        });
    }

    for entry in &index.entries {
        let name = entry.name.as_str();
        let existing = local_kind(name);

        let action = match entry.entry_type {
            EntryType::File => match existing {
                None => SyncAction::Add,
                Some(LocalKind::Directory) => SyncAction::Update,
                Some(LocalKind::File) => file_action(dir_path, entry, cache),
            },
            EntryType::Directory => match existing {
                None => SyncAction::Add,
                Some(LocalKind::File) => SyncAction::Update,
                Some(LocalKind::Directory) => {
                    let saved = saved_index_hash(&dir_path.join(name));
                    match saved {
                        Some(saved) if hash::hashes_match(&saved, &entry.hash) => {
                            SyncAction::UpToDate
                        }
                        _ => SyncAction::Update,
                    }
                }
            },
            EntryType::Tarball => {
                let stem_exists = local_kind(tarball_stem(name)) == Some(LocalKind::Directory);
                match cache.hash(name) {
                    Some(cached) if stem_exists && hash::hashes_match(cached, &entry.hash) => {
                        SyncAction::UpToDate
                    }
                    Some(_) => SyncAction::Update,
                    None if stem_exists => SyncAction::Update,
                    None => SyncAction::Add,
                }
            }
        };

        planned.push(PlannedItem {
            item: item(entry.entry_type, name, action),
            entry: Some(entry.clone()),
            local: existing,
        });
    }

    Ok(planned)
}

fn file_action(dir_path: &Path, entry: &DirectoryIndexEntry, cache: &mut HashCache) -> SyncAction {
    if entry.hash.is_empty() {
        let size = fs::metadata(dir_path.join(&entry.name)).map(|m| m.len());
        return match size {
            Ok(size) if size == entry.size => SyncAction::UpToDate,
            _ => SyncAction::Update,
        };
    }

    match cache.hash_for_file(dir_path, &entry.name) {
        Ok(local) if hash::hashes_match(&local, &entry.hash) => SyncAction::UpToDate,
        Ok(_) => SyncAction::Update,
        Err(e) => {
            debug!(name = %entry.name, error = %e, "Could not hash local file");
            SyncAction::Update
        }
    }
}
