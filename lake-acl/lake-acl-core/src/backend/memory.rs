//! In-process backend that behaves like a hierarchical-namespace account.
//!
//! Used by tests and for exercising the engine without an account. Every
//! call is recorded, failures can be injected per operation, and the pages
//! returned by the recursive update can be scripted.

use super::{
    AclBackend, BackendResult, ContainerHandle, DirectoryHandle, PathItem, RecursiveUpdate,
};
use crate::acl::{AclEntry, AclSet, EntryScope};
use crate::error::{BackendError, FormatError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

/// Entries every new container root and directory starts with.
pub const BASE_ENTRIES: &str = "user::rwx,group::r-x,other::---";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    CreateContainer,
    CreateDirectory,
    GetEntries,
    SetEntry,
    UpdateRecursive,
    ListPaths,
    ListContainers,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateContainer(String),
    CreateDirectory(String),
    GetEntries(String),
    SetEntry {
        dir: String,
        entry: String,
    },
    UpdateRecursive {
        dir: String,
        entry: String,
        continuation: Option<String>,
    },
    ListPaths(String),
    ListContainers,
}

impl Call {
    pub fn kind(&self) -> CallKind {
        match self {
            Call::CreateContainer(_) => CallKind::CreateContainer,
            Call::CreateDirectory(_) => CallKind::CreateDirectory,
            Call::GetEntries(_) => CallKind::GetEntries,
            Call::SetEntry { .. } => CallKind::SetEntry,
            Call::UpdateRecursive { .. } => CallKind::UpdateRecursive,
            Call::ListPaths(_) => CallKind::ListPaths,
            Call::ListContainers => CallKind::ListContainers,
        }
    }
}

#[derive(Clone, Debug)]
struct Item {
    is_directory: bool,
    acls: AclSet,
}

#[derive(Default)]
struct State {
    /// container -> path -> item; the root is stored under "".
    containers: BTreeMap<String, BTreeMap<String, Item>>,
    calls: Vec<Call>,
    /// (kind, calls of that kind to let through first, error)
    failures: Vec<(CallKind, usize, BackendError)>,
    recursive_pages: VecDeque<Option<String>>,
    reverse_listing: bool,
}

impl State {
    fn take_failure(&mut self, kind: CallKind) -> BackendResult<()> {
        let Some(pos) = self.failures.iter().position(|(k, _, _)| *k == kind) else {
            return Ok(());
        };
        if self.failures[pos].1 > 0 {
            self.failures[pos].1 -= 1;
            return Ok(());
        }
        Err(self.failures.remove(pos).2)
    }

    fn item_mut(&mut self, dir: &DirectoryHandle) -> BackendResult<&mut Item> {
        self.containers
            .get_mut(&dir.container)
            .and_then(|items| items.get_mut(&dir.path))
            .ok_or_else(|| BackendError::NotFound(dir.to_string()))
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a container whose root carries `entries` (wire list).
    pub fn add_container(&self, name: &str, entries: &str) -> Result<(), FormatError> {
        self.add_item(name, "", true, entries)
    }

    /// Seed a directory without any parent checks or inheritance.
    pub fn add_directory(
        &self,
        container: &str,
        path: &str,
        entries: &str,
    ) -> Result<(), FormatError> {
        self.add_item(container, path, true, entries)
    }

    pub fn add_file(&self, container: &str, path: &str, entries: &str) -> Result<(), FormatError> {
        self.add_item(container, path, false, entries)
    }

    fn add_item(
        &self,
        container: &str,
        path: &str,
        is_directory: bool,
        entries: &str,
    ) -> Result<(), FormatError> {
        let acls = AclSet::parse_wire(entries)?;
        let mut state = self.state.lock();
        state
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(path.to_string(), Item { is_directory, acls });
        Ok(())
    }

    /// Current entries of a path, `""` being the container root.
    pub fn entries(&self, container: &str, path: &str) -> Option<AclSet> {
        let state = self.state.lock();
        state
            .containers
            .get(container)
            .and_then(|items| items.get(path))
            .map(|item| item.acls.clone())
    }

    pub fn contains(&self, container: &str, path: &str) -> bool {
        self.entries(container, path).is_some()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.kind() == kind).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make the next call of `kind` fail with `error`. Failures queue up.
    pub fn fail_next(&self, kind: CallKind, error: BackendError) {
        self.fail_after(kind, 0, error);
    }

    /// Let `skip` calls of `kind` succeed, then fail the next one.
    pub fn fail_after(&self, kind: CallKind, skip: usize, error: BackendError) {
        self.state.lock().failures.push((kind, skip, error));
    }

    /// Continuation tokens returned by successive recursive updates. Once the
    /// script runs out, updates complete in one page.
    pub fn script_recursive_pages<I, S>(&self, pages: I)
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        let mut state = self.state.lock();
        state
            .recursive_pages
            .extend(pages.into_iter().map(|p| p.map(Into::into)));
    }

    /// List paths deepest-first, as a service without ordering guarantees might.
    pub fn reverse_listing(&self) {
        self.state.lock().reverse_listing = true;
    }
}

/// Entries a new directory receives under `parent`: the base entries, then
/// the parent's default entries both as access and default entries.
fn inherited(parent: Option<&Item>) -> AclSet {
    let mut acls = AclSet::parse_wire(BASE_ENTRIES).unwrap_or_default();
    if let Some(parent) = parent {
        for entry in parent.acls.defaults() {
            acls.insert(entry.clone().with_scope(EntryScope::Access));
            acls.insert(entry);
        }
    }
    acls
}

fn in_subtree(root: &str, path: &str) -> bool {
    root.is_empty() || path == root || path.starts_with(&format!("{}/", root))
}

#[async_trait]
impl AclBackend for MemoryBackend {
    async fn create_container_if_absent(&self, name: &str) -> BackendResult<ContainerHandle> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateContainer(name.to_string()));
        state.take_failure(CallKind::CreateContainer)?;
        let items = state.containers.entry(name.to_string()).or_default();
        items.entry(String::new()).or_insert_with(|| Item {
            is_directory: true,
            acls: inherited(None),
        });
        Ok(ContainerHandle::new(name))
    }

    async fn create_directory_if_absent(
        &self,
        container: &ContainerHandle,
        path: &str,
    ) -> BackendResult<DirectoryHandle> {
        let mut state = self.state.lock();
        state
            .calls
            .push(Call::CreateDirectory(format!("{}/{}", container.name, path)));
        state.take_failure(CallKind::CreateDirectory)?;
        let items = state
            .containers
            .get_mut(&container.name)
            .ok_or_else(|| BackendError::NotFound(container.name.clone()))?;

        let mut prefix = String::new();
        for segment in path.split('/') {
            let parent_path = prefix.clone();
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            if !items.contains_key(&prefix) {
                let acls = inherited(items.get(&parent_path));
                items.insert(
                    prefix.clone(),
                    Item {
                        is_directory: true,
                        acls,
                    },
                );
            }
        }
        Ok(DirectoryHandle {
            container: container.name.clone(),
            path: path.to_string(),
        })
    }

    async fn get_entries(&self, dir: &DirectoryHandle) -> BackendResult<String> {
        let mut state = self.state.lock();
        state.calls.push(Call::GetEntries(dir.to_string()));
        state.take_failure(CallKind::GetEntries)?;
        Ok(state.item_mut(dir)?.acls.render_wire())
    }

    async fn set_entry(&self, dir: &DirectoryHandle, entry: &AclEntry) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::SetEntry {
            dir: dir.to_string(),
            entry: entry.render_wire(),
        });
        state.take_failure(CallKind::SetEntry)?;
        state.item_mut(dir)?.acls.insert(entry.clone());
        Ok(())
    }

    async fn update_entries_recursive(
        &self,
        dir: &DirectoryHandle,
        entry: &AclEntry,
        continuation: Option<&str>,
    ) -> BackendResult<RecursiveUpdate> {
        let mut state = self.state.lock();
        state.calls.push(Call::UpdateRecursive {
            dir: dir.to_string(),
            entry: entry.render_wire(),
            continuation: continuation.map(str::to_string),
        });
        state.take_failure(CallKind::UpdateRecursive)?;
        state.item_mut(dir)?;

        let mut update = RecursiveUpdate::default();
        if let Some(items) = state.containers.get_mut(&dir.container) {
            for (path, item) in items.iter_mut() {
                if !in_subtree(&dir.path, path) {
                    continue;
                }
                // default entries only exist on directories
                if entry.is_default() && !item.is_directory {
                    continue;
                }
                item.acls.insert(entry.clone());
                if item.is_directory {
                    update.directories_successful += 1;
                } else {
                    update.files_successful += 1;
                }
            }
        }
        update.continuation = state.recursive_pages.pop_front().flatten();
        Ok(update)
    }

    async fn list_paths(&self, container: &ContainerHandle) -> BackendResult<Vec<PathItem>> {
        let mut state = self.state.lock();
        state.calls.push(Call::ListPaths(container.name.clone()));
        state.take_failure(CallKind::ListPaths)?;
        let items = state
            .containers
            .get(&container.name)
            .ok_or_else(|| BackendError::NotFound(container.name.clone()))?;
        let mut paths: Vec<PathItem> = items
            .iter()
            .filter(|(path, _)| !path.is_empty())
            .map(|(path, item)| PathItem {
                name: path.clone(),
                is_directory: item.is_directory,
            })
            .collect();
        if state.reverse_listing {
            paths.reverse();
        }
        Ok(paths)
    }

    async fn list_containers(&self) -> BackendResult<Vec<ContainerHandle>> {
        let mut state = self.state.lock();
        state.calls.push(Call::ListContainers);
        state.take_failure(CallKind::ListContainers)?;
        Ok(state.containers.keys().map(ContainerHandle::new).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(s: &str) -> AclEntry {
        AclEntry::parse_wire(s).unwrap()
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let backend = MemoryBackend::new();
        let c = backend.create_container_if_absent("c").await.unwrap();
        let root = backend.root_directory(&c);
        backend.set_entry(&root, &entry("user:a:rwx")).await.unwrap();
        backend.create_container_if_absent("c").await.unwrap();
        assert!(backend
            .get_entries(&root)
            .await
            .unwrap()
            .contains("user:a:rwx"));

        backend.create_directory_if_absent(&c, "x/y").await.unwrap();
        assert!(backend.contains("c", "x"));
        backend.create_directory_if_absent(&c, "x/y").await.unwrap();
        assert_eq!(backend.calls_of(CallKind::CreateDirectory).len(), 2);
    }

    #[tokio::test]
    async fn new_directories_inherit_defaults() {
        let backend = MemoryBackend::new();
        let c = backend.create_container_if_absent("c").await.unwrap();
        let root = backend.root_directory(&c);
        backend
            .set_entry(&root, &entry("default:group:g:r-x"))
            .await
            .unwrap();
        backend.create_directory_if_absent(&c, "x").await.unwrap();
        let acls = backend.entries("c", "x").unwrap();
        assert!(acls.contains(&entry("group:g:---")));
        assert!(acls.contains(&entry("default:group:g:---")));
    }

    #[tokio::test]
    async fn recursive_update_covers_subtree_only() {
        let backend = MemoryBackend::new();
        backend.add_container("c", BASE_ENTRIES).unwrap();
        backend.add_directory("c", "a", BASE_ENTRIES).unwrap();
        backend.add_directory("c", "a/b", BASE_ENTRIES).unwrap();
        backend
            .add_file("c", "a/b/f.csv", "user::rw-,group::r--,other::---")
            .unwrap();
        backend.add_directory("c", "ab", BASE_ENTRIES).unwrap();
        let dir = DirectoryHandle {
            container: "c".to_string(),
            path: "a".to_string(),
        };
        let update = backend
            .update_entries_recursive(&dir, &entry("user:u:r-x"), None)
            .await
            .unwrap();
        assert_eq!(update.directories_successful, 2);
        assert_eq!(update.files_successful, 1);
        assert_eq!(update.continuation, None);
        assert!(backend.entries("c", "a/b/f.csv").unwrap().contains(&entry("user:u:---")));
        assert!(!backend.entries("c", "ab").unwrap().contains(&entry("user:u:---")));
    }

    #[tokio::test]
    async fn scripted_pages_and_failures() {
        let backend = MemoryBackend::new();
        backend.add_container("c", BASE_ENTRIES).unwrap();
        backend.script_recursive_pages([Some("t1"), None]);
        backend.fail_next(CallKind::GetEntries, BackendError::NotFound("boom".into()));
        let root = DirectoryHandle {
            container: "c".to_string(),
            path: String::new(),
        };
        assert!(backend.get_entries(&root).await.is_err());
        assert!(backend.get_entries(&root).await.is_ok());
        let e = entry("user:u:r-x");
        let first = backend.update_entries_recursive(&root, &e, None).await.unwrap();
        assert_eq!(first.continuation.as_deref(), Some("t1"));
        let second = backend
            .update_entries_recursive(&root, &e, Some("t1"))
            .await
            .unwrap();
        assert_eq!(second.continuation, None);
    }
}
