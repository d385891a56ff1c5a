//! The YAML document describing containers, folders and their entries.
//!
//! The same types serve as input (`set-acl`) and output (`get-acl`): an
//! account snapshot is always a valid input document.

use crate::error::{AclError, ValidationError};
use crate::tree::Tree;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AclDocument {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
}

/// A container, or a folder nested anywhere below one.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub acls: Vec<EntryConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folders: Vec<FolderConfig>,
}

pub type FolderConfig = ContainerConfig;

/// One declared entry. All keys are optional at the serde level so that
/// missing keys are reported as schema violations with their location.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EntryConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub principal_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_acl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recursive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl EntryConfig {
    /// Compact single-line rendering used in error reports.
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

impl ContainerConfig {
    pub fn describe(&self) -> String {
        format!(
            "{{name: {:?}, acls: {}, folders: {}}}",
            self.name,
            self.acls.len(),
            self.folders.len()
        )
    }
}

impl AclDocument {
    /// Parse a document and check its top-level shape.
    pub fn from_yaml(source: &str) -> Result<Self, ValidationError> {
        let doc: AclDocument =
            serde_yaml::from_str(source).map_err(|e| schema_error(source, &e))?;
        if doc.account.is_empty() {
            return Err(ValidationError::new(
                "account",
                "missing required key `account`",
                "<document>",
            ));
        }
        Ok(doc)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AclError> {
        let source = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&source)?)
    }

    pub fn to_yaml(&self) -> Result<String, AclError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AclError> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Build one tree per container. Every entry and folder of the whole
    /// document is validated here, so callers can do this before touching
    /// the backend.
    pub fn trees(&self) -> Result<Vec<Tree>, ValidationError> {
        self.containers
            .iter()
            .enumerate()
            .map(|(i, container)| Tree::from_config_at(container, &format!("containers[{}]", i)))
            .collect()
    }
}

fn schema_error(source: &str, err: &serde_yaml::Error) -> ValidationError {
    match err.location() {
        Some(loc) => {
            let line = source
                .lines()
                .nth(loc.line().saturating_sub(1))
                .unwrap_or_default()
                .trim();
            ValidationError::new(
                format!("line {} column {}", loc.line(), loc.column()),
                err.to_string(),
                line,
            )
        }
        None => ValidationError::new("document", err.to_string(), "<document>"),
    }
}
