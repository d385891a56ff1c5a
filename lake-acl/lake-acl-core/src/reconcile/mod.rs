//! Drives a backend so that remote entries match a declared tree, and reads
//! an account's entries back into document form.

use crate::acl::{AclEntry, AclSet};
use crate::backend::{AclBackend, ContainerHandle, DirectoryHandle};
use crate::config::AclDocument;
use crate::error::{AclError, BackendError, Result};
use crate::tree::{NodeId, NodeKind, Order, Tree};
use std::future::Future;
use std::sync::Arc;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

mod retry;

pub use retry::RetryPolicy;

/// Retry behaviour for each pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Container and directory creation, entry reads and writes.
    pub apply: RetryPolicy,
    /// Recursive updates. Continuation pages count against the budget.
    pub recursive: RetryPolicy,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            apply: RetryPolicy::once(),
            recursive: RetryPolicy::attempts(3),
        }
    }
}

/// Result of reading an account back.
#[derive(Debug)]
pub struct AccountSnapshot {
    pub document: AclDocument,
    /// Containers left out because their listing could not be assembled.
    pub skipped: Vec<AclError>,
}

impl AccountSnapshot {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

pub struct Reconciler {
    backend: Arc<dyn AclBackend>,
    options: ReconcileOptions,
    dispatch: Option<Dispatch>,
}

impl Reconciler {
    pub fn new(backend: Arc<dyn AclBackend>) -> Self {
        Self {
            backend,
            options: ReconcileOptions::default(),
            dispatch: None,
        }
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    /// Log through `dispatch` instead of whatever subscriber is current.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    async fn scoped<T>(&self, fut: impl Future<Output = T>) -> T {
        match &self.dispatch {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
            None => fut.await,
        }
    }

    /// Make the remote container match `tree`.
    ///
    /// The first pass visits nodes breadth-first, merging each node's
    /// declared entries over the special entries already present remotely
    /// and pushing its default entries into its children. The second pass
    /// applies recursive entries to whole subtrees. Nothing is rolled back
    /// when a pass fails part way.
    pub async fn apply(&self, tree: &mut Tree) -> Result<()> {
        self.scoped(self.apply_tree(tree)).await
    }

    async fn apply_tree(&self, tree: &mut Tree) -> Result<()> {
        info!("Applying entries to container {}", tree.name(tree.root()));

        let mut walk = tree.walk(Order::BreadthFirst);
        while let Some(id) = walk.next(tree) {
            self.apply_node(tree, id).await?;
        }

        let mut walk = tree.walk(Order::BreadthFirst);
        while let Some(id) = walk.next(tree) {
            if tree.node(id).acls().has_recursive() {
                self.apply_recursive(tree, id).await?;
            }
        }
        Ok(())
    }

    /// First-pass work for one node.
    ///
    /// Default entries are copied into the direct children without their
    /// recursive flag: the bulk update issued for this node already covers
    /// the whole subtree, so descendants never repeat it.
    pub async fn apply_node(&self, tree: &mut Tree, id: NodeId) -> Result<()> {
        let path = tree.display_path(id);
        info!("Processing {}", path);
        let dir = &self.resolve(tree, id).await?;

        let backend = self.backend.as_ref();
        let current = self
            .options
            .apply
            .call(&path, move || backend.get_entries(dir))
            .await
            .map_err(|e| AclError::backend(&path, e))?;
        let current = AclSet::parse_wire(&current)?;

        let mut merged = current.specials();
        merged.extend(tree.node(id).acls().iter().cloned());
        for entry in merged.iter() {
            info!("  {} {}", path, entry);
            self.options
                .apply
                .call(&path, move || backend.set_entry(dir, entry))
                .await
                .map_err(|e| AclError::backend(&path, e))?;
        }

        let pushdown = tree.node(id).acls().defaults();
        if !pushdown.is_empty() {
            let children = tree.node(id).children().to_vec();
            for child in children {
                let acls = tree.node_mut(child).acls_mut();
                for entry in pushdown.iter() {
                    acls.insert_if_absent(entry.clone().with_recursive(false));
                }
            }
        }
        Ok(())
    }

    /// Second-pass work for one node: every recursive entry it declares.
    pub async fn apply_recursive(&self, tree: &Tree, id: NodeId) -> Result<()> {
        let path = tree.display_path(id);
        let dir = self.resolve(tree, id).await?;
        for entry in tree.node(id).acls().recursive().iter() {
            info!("Applying {} recursively below {}", entry, path);
            self.update_recursive(&dir, entry, &path).await?;
        }
        Ok(())
    }

    /// Map the node kind to the backend calls that produce its handle.
    async fn resolve(&self, tree: &Tree, id: NodeId) -> Result<DirectoryHandle> {
        let backend = self.backend.as_ref();
        let path = tree.display_path(id);
        let container = tree.name(tree.get_root(id));
        match tree.kind(id) {
            NodeKind::Root => {
                let handle = self
                    .options
                    .apply
                    .call(&path, move || backend.create_container_if_absent(container))
                    .await
                    .map_err(|e| AclError::backend(&path, e))?;
                Ok(backend.root_directory(&handle))
            }
            NodeKind::Directory => {
                let relative = tree.path_in_filesystem(id);
                if relative.is_empty() || relative.split('/').any(str::is_empty) {
                    return Err(AclError::TypeMismatch(format!(
                        "`{}` is a directory node without a usable path",
                        path
                    )));
                }
                let handle = ContainerHandle::new(container);
                let relative = relative.as_str();
                let handle = &handle;
                self.options
                    .apply
                    .call(&path, move || {
                        backend.create_directory_if_absent(handle, relative)
                    })
                    .await
                    .map_err(|e| AclError::backend(&path, e))
            }
        }
    }

    /// Drive the continuation protocol for one entry. Every call, whether it
    /// returns a token or fails transiently, spends one attempt; transient
    /// failures resume from the last token received.
    async fn update_recursive(
        &self,
        dir: &DirectoryHandle,
        entry: &AclEntry,
        path: &str,
    ) -> Result<()> {
        let policy = &self.options.recursive;
        let budget = policy.budget();
        let mut continuation: Option<String> = None;
        let mut last_failure: Option<BackendError> = None;
        let mut consecutive_failures = 0;
        let (mut directories, mut files, mut failures) = (0u64, 0u64, 0u64);

        for attempt in 1..=budget {
            if consecutive_failures > 0 {
                tokio::time::sleep(policy.backoff_for_attempt(consecutive_failures - 1)).await;
            }
            let call = self
                .backend
                .update_entries_recursive(dir, entry, continuation.as_deref());
            match policy.run_once(call).await {
                Ok(update) => {
                    consecutive_failures = 0;
                    last_failure = None;
                    directories += update.directories_successful;
                    files += update.files_successful;
                    failures += update.failure_count;
                    if update.failure_count > 0 {
                        warn!(
                            "{} entries below {} could not be updated with {}",
                            update.failure_count, path, entry
                        );
                    }
                    match update.continuation {
                        Some(token) => {
                            debug!("{}: continuing recursive update ({}/{})", path, attempt, budget);
                            continuation = Some(token);
                        }
                        None => {
                            info!(
                                "  {} recursive {}: {} directories, {} files, {} failures",
                                path, entry, directories, files, failures
                            );
                            return Ok(());
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "{}: recursive update attempt {}/{} failed: {}",
                        path, attempt, budget, e
                    );
                    consecutive_failures += 1;
                    last_failure = Some(e);
                }
                Err(e) => return Err(AclError::backend(path, e)),
            }
        }

        Err(match last_failure {
            Some(source) => AclError::RetriesExhausted {
                path: path.to_string(),
                entry: entry.render_wire(),
                attempts: budget,
                source,
            },
            None => AclError::ContinuationExhausted {
                path: path.to_string(),
                entry: entry.render_wire(),
                attempts: budget,
            },
        })
    }

    /// Read every container of `account` into a document. Containers whose
    /// hierarchy cannot be assembled are reported in
    /// [`AccountSnapshot::skipped`]; any other failure aborts.
    pub async fn snapshot_account(
        &self,
        account: &str,
        omit_special: bool,
    ) -> Result<AccountSnapshot> {
        self.scoped(self.snapshot(account, omit_special)).await
    }

    async fn snapshot(&self, account: &str, omit_special: bool) -> Result<AccountSnapshot> {
        let backend = self.backend.as_ref();
        let containers = self
            .options
            .apply
            .call(account, move || backend.list_containers())
            .await
            .map_err(|e| AclError::backend(account, e))?;

        let mut document = AclDocument {
            account: account.to_string(),
            containers: Vec::with_capacity(containers.len()),
        };
        let mut skipped = Vec::new();
        for container in &containers {
            info!("Reading container {}", container.name);
            match self.snapshot_container(container, omit_special).await {
                Ok(tree) => document.containers.push(tree.to_document(tree.root())),
                Err(e @ AclError::Lookup { .. }) => {
                    error!("Skipping container {}: {}", container.name, e);
                    skipped.push(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(AccountSnapshot { document, skipped })
    }

    /// Build a tree mirroring one container's directories and their entries.
    pub async fn snapshot_container(
        &self,
        container: &ContainerHandle,
        omit_special: bool,
    ) -> Result<Tree> {
        let backend = self.backend.as_ref();
        let policy = &self.options.apply;

        let root_dir = &backend.root_directory(container);
        let mut tree = Tree::new(container.name.clone());
        let root = tree.root();
        let wire = policy
            .call(&container.name, move || backend.get_entries(root_dir))
            .await
            .map_err(|e| AclError::backend(root_dir.to_string(), e))?;
        *tree.node_mut(root).acls_mut() = read_entries(&wire, omit_special)?;

        let listing = policy
            .call(&container.name, move || backend.list_paths(container))
            .await
            .map_err(|e| AclError::backend(&container.name, e))?;
        let mut directories: Vec<String> = listing
            .into_iter()
            .filter(|item| item.is_directory)
            .map(|item| item.name)
            .collect();
        directories.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));

        for path in directories {
            let (parent_path, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
            let parent = tree
                .find_by_relative_path(root, parent_path)
                .ok_or_else(|| AclError::Lookup {
                    container: container.name.clone(),
                    path: path.clone(),
                })?;
            let dir = &DirectoryHandle {
                container: container.name.clone(),
                path: path.clone(),
            };
            let wire = policy
                .call(&path, move || backend.get_entries(dir))
                .await
                .map_err(|e| AclError::backend(dir.to_string(), e))?;
            let child = tree.add_child(parent, name);
            *tree.node_mut(child).acls_mut() = read_entries(&wire, omit_special)?;
        }
        Ok(tree)
    }
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

fn read_entries(wire: &str, omit_special: bool) -> Result<AclSet> {
    let entries = AclSet::parse_wire(wire)?;
    Ok(if omit_special {
        entries.filtered(|e| !e.is_special())
    } else {
        entries
    })
}
