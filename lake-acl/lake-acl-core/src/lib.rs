pub mod acl;
pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod tree;

pub use acl::{AclEntry, AclSet, EntryScope, Permissions, PrincipalType};
pub use backend::{AclBackend, DataLakeBackend, MemoryBackend};
pub use config::{AclDocument, ContainerConfig, EntryConfig};
pub use error::{AclError, AuthError, BackendError, FormatError, ValidationError};
pub use reconcile::{AccountSnapshot, ReconcileOptions, Reconciler, RetryPolicy};
pub use tree::{NodeId, NodeKind, Tree};
