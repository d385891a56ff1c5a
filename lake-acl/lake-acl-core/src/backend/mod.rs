//! The storage capabilities the reconciliation engine depends on.

use crate::acl::AclEntry;
use crate::error::BackendError;
use async_trait::async_trait;

pub mod datalake;
pub mod memory;

pub use datalake::DataLakeBackend;
pub use memory::MemoryBackend;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub name: String,
}

impl ContainerHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A directory inside a container. An empty `path` is the container root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DirectoryHandle {
    pub container: String,
    pub path: String,
}

impl DirectoryHandle {
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

impl std::fmt::Display for DirectoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}/", self.container)
        } else {
            write!(f, "{}/{}", self.container, self.path)
        }
    }
}

/// Outcome of one page of a recursive update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecursiveUpdate {
    /// Present when the service stopped before covering the whole subtree.
    pub continuation: Option<String>,
    pub directories_successful: u64,
    pub files_successful: u64,
    pub failure_count: u64,
}

/// One item of a recursive path listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathItem {
    pub name: String,
    pub is_directory: bool,
}

#[async_trait]
pub trait AclBackend: Send + Sync {
    /// Create the container, treating "already exists" as success.
    async fn create_container_if_absent(&self, name: &str) -> BackendResult<ContainerHandle>;

    fn root_directory(&self, container: &ContainerHandle) -> DirectoryHandle {
        DirectoryHandle {
            container: container.name.clone(),
            path: String::new(),
        }
    }

    /// Create the directory (and missing parents), treating "already exists"
    /// as success.
    async fn create_directory_if_absent(
        &self,
        container: &ContainerHandle,
        path: &str,
    ) -> BackendResult<DirectoryHandle>;

    /// The directory's entries as a comma-joined wire string.
    async fn get_entries(&self, dir: &DirectoryHandle) -> BackendResult<String>;

    /// Merge one entry into the directory's entry list by identity key.
    async fn set_entry(&self, dir: &DirectoryHandle, entry: &AclEntry) -> BackendResult<()>;

    /// Apply one entry to the directory and everything below it, resuming
    /// from `continuation` when given.
    async fn update_entries_recursive(
        &self,
        dir: &DirectoryHandle,
        entry: &AclEntry,
        continuation: Option<&str>,
    ) -> BackendResult<RecursiveUpdate>;

    /// Every path below the container root, in service order.
    async fn list_paths(&self, container: &ContainerHandle) -> BackendResult<Vec<PathItem>>;

    async fn list_containers(&self) -> BackendResult<Vec<ContainerHandle>>;
}
