//! Access-control entries and identity-keyed entry sets.
//!
//! An [`AclEntry`] is identified by its scope, principal type and principal
//! id. Two entries that only differ in permissions are the same entry, and
//! merging them into an [`AclSet`] keeps whichever was written last.

use crate::config::EntryConfig;
use crate::error::{FormatError, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

const DEFAULT_SCOPE: &str = "default";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    User,
    Group,
    Mask,
    Other,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::User => "user",
            PrincipalType::Group => "group",
            PrincipalType::Mask => "mask",
            PrincipalType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(PrincipalType::User),
            "group" => Some(PrincipalType::Group),
            "mask" => Some(PrincipalType::Mask),
            "other" => Some(PrincipalType::Other),
            _ => None,
        }
    }
}

/// Whether an entry governs the node itself or is inherited by new children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryScope {
    #[default]
    Access,
    Default,
}

impl EntryScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            DEFAULT_SCOPE => Some(EntryScope::Default),
            _ => None,
        }
    }

    /// The wire prefix, if the scope has one.
    pub fn prefix(&self) -> Option<&'static str> {
        match self {
            EntryScope::Access => None,
            EntryScope::Default => Some(DEFAULT_SCOPE),
        }
    }
}

/// A three character permission string such as `r-x`.
///
/// Input is case-insensitive and normalised to lower case. The execute
/// position also accepts the sticky markers `t`/`T`, kept as given.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Permissions(String);

impl Permissions {
    pub fn parse(s: &str) -> Option<Self> {
        let chars: Vec<char> = s.chars().collect();
        if chars.len() != 3 {
            return None;
        }
        let mut out = String::with_capacity(3);
        for (pos, c) in chars.into_iter().enumerate() {
            let normalised = match (pos, c) {
                (_, '-') => '-',
                (2, 't') | (2, 'T') => c,
                (0, 'r') | (0, 'R') => 'r',
                (1, 'w') | (1, 'W') => 'w',
                (2, 'x') | (2, 'X') => 'x',
                _ => return None,
            };
            out.push(normalised);
        }
        Some(Self(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity of an entry. Ordering puts access entries before default
/// entries, then orders by principal type and id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub scope: EntryScope,
    pub principal_type: PrincipalType,
    pub principal_id: String,
}

/// A single access-control entry.
#[derive(Clone, Debug)]
pub struct AclEntry {
    principal_type: PrincipalType,
    principal_id: String,
    permissions: Permissions,
    scope: EntryScope,
    recursive: bool,
}

impl AclEntry {
    pub fn new(
        principal_type: PrincipalType,
        principal_id: impl Into<String>,
        permissions: Permissions,
    ) -> Self {
        Self {
            principal_type,
            principal_id: principal_id.into(),
            permissions,
            scope: EntryScope::Access,
            recursive: false,
        }
    }

    pub fn with_scope(mut self, scope: EntryScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Parse the service representation `[default:]type:oid:perm`.
    pub fn parse_wire(input: &str) -> Result<Self, FormatError> {
        let fields: Vec<&str> = input.split(':').collect();
        let (scope, p_type, oid, perm) = match fields.as_slice() {
            [p_type, oid, perm] => (EntryScope::Access, *p_type, *oid, *perm),
            [scope, p_type, oid, perm] => {
                let scope = EntryScope::parse(scope).ok_or_else(|| FormatError::Scope {
                    input: input.to_string(),
                    value: scope.to_string(),
                })?;
                (scope, *p_type, *oid, *perm)
            }
            _ => {
                return Err(FormatError::FieldCount {
                    input: input.to_string(),
                    fields: fields.len(),
                })
            }
        };
        let principal_type =
            PrincipalType::parse(p_type).ok_or_else(|| FormatError::PrincipalType {
                input: input.to_string(),
                value: p_type.to_string(),
            })?;
        let permissions = Permissions::parse(perm).ok_or_else(|| FormatError::Permissions {
            input: input.to_string(),
            value: perm.to_string(),
        })?;
        Ok(Self::new(principal_type, oid, permissions).with_scope(scope))
    }

    /// Build an entry from a document fragment (`{type, oid, acl|default_acl, ...}`).
    pub fn parse_document(fragment: &serde_yaml::Value) -> Result<Self, ValidationError> {
        let config: EntryConfig = serde_yaml::from_value(fragment.clone()).map_err(|e| {
            ValidationError::new("acl", e.to_string(), compact(fragment))
        })?;
        Self::from_config(&config, "acl")
    }

    /// Build an entry from an already deserialised document entry.
    pub fn from_config(config: &EntryConfig, location: &str) -> Result<Self, ValidationError> {
        let fail = |rule: &str| ValidationError::new(location, rule, config.describe());

        let p_type = config
            .principal_type
            .as_deref()
            .ok_or_else(|| fail("missing required key `type`"))?;
        let principal_type = PrincipalType::parse(p_type)
            .ok_or_else(|| fail("`type` must be one of user, group, mask, other"))?;
        let oid = config
            .oid
            .as_deref()
            .ok_or_else(|| fail("missing required key `oid`"))?;

        let (perm, mut scope) = match (config.acl.as_deref(), config.default_acl.as_deref()) {
            (Some(acl), None) => (acl, EntryScope::Access),
            (None, Some(acl)) => (acl, EntryScope::Default),
            (None, None) => return Err(fail("missing required key `acl` or `default_acl`")),
            (Some(_), Some(_)) => return Err(fail("only one of `acl` and `default_acl` may be set")),
        };
        if let Some(value) = config.scope.as_deref() {
            scope = EntryScope::parse(value).ok_or_else(|| fail("`scope` must be `default`"))?;
        }
        let permissions = Permissions::parse(perm).ok_or_else(|| {
            fail("permissions must be three characters over r, w, x, - (t marks sticky in the last position)")
        })?;

        Ok(Self::new(principal_type, oid, permissions)
            .with_scope(scope)
            .with_recursive(config.recursive.unwrap_or(false)))
    }

    /// Inverse of [`AclEntry::parse_wire`].
    pub fn render_wire(&self) -> String {
        match self.scope.prefix() {
            Some(prefix) => format!(
                "{}:{}:{}:{}",
                prefix,
                self.principal_type.as_str(),
                self.principal_id,
                self.permissions
            ),
            None => format!(
                "{}:{}:{}",
                self.principal_type.as_str(),
                self.principal_id,
                self.permissions
            ),
        }
    }

    /// Output document form. The recursive flag is an input-only directive.
    pub fn to_config(&self) -> EntryConfig {
        EntryConfig {
            principal_type: Some(self.principal_type.as_str().to_string()),
            oid: Some(self.principal_id.clone()),
            acl: Some(self.permissions.to_string()),
            default_acl: None,
            recursive: None,
            scope: self.scope.prefix().map(str::to_string),
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey {
            scope: self.scope,
            principal_type: self.principal_type,
            principal_id: self.principal_id.clone(),
        }
    }

    pub fn principal_type(&self) -> PrincipalType {
        self.principal_type
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    pub fn scope(&self) -> EntryScope {
        self.scope
    }

    pub fn is_owner(&self) -> bool {
        self.principal_type == PrincipalType::User && self.principal_id.is_empty()
    }

    pub fn is_owner_group(&self) -> bool {
        self.principal_type == PrincipalType::Group && self.principal_id.is_empty()
    }

    pub fn is_mask(&self) -> bool {
        self.principal_type == PrincipalType::Mask
    }

    pub fn is_other(&self) -> bool {
        self.principal_type == PrincipalType::Other
    }

    /// Owner, owning group, mask or other.
    pub fn is_special(&self) -> bool {
        self.is_owner() || self.is_owner_group() || self.is_mask() || self.is_other()
    }

    /// A grant to a specific user or group.
    pub fn is_named(&self) -> bool {
        !self.is_special()
    }

    pub fn is_default(&self) -> bool {
        self.scope == EntryScope::Default
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }
}

impl PartialEq for AclEntry {
    fn eq(&self, other: &Self) -> bool {
        self.principal_type == other.principal_type
            && self.principal_id == other.principal_id
            && self.scope == other.scope
    }
}

impl Eq for AclEntry {}

impl Hash for AclEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scope.hash(state);
        self.principal_type.hash(state);
        self.principal_id.hash(state);
    }
}

impl fmt::Display for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_wire())
    }
}

impl std::str::FromStr for AclEntry {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_wire(s)
    }
}

/// Entries keyed by identity. Inserting an entry whose key is already present
/// replaces it.
#[derive(Clone, Debug, Default)]
pub struct AclSet {
    entries: BTreeMap<EntryKey, AclEntry>,
}

/// Two sets are equal when they hold the same keys with the same permissions.
impl PartialEq for AclSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a.permissions == b.permissions)
    }
}

impl Eq for AclSet {}

impl AclSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-joined entry list as returned by the service.
    pub fn parse_wire(list: &str) -> Result<Self, FormatError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(AclEntry::parse_wire)
            .collect()
    }

    pub fn render_wire(&self) -> String {
        self.iter()
            .map(AclEntry::render_wire)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Insert, replacing any entry with the same key. Returns the replaced entry.
    pub fn insert(&mut self, entry: AclEntry) -> Option<AclEntry> {
        self.entries.insert(entry.key(), entry)
    }

    /// Insert only when no entry with the same key exists. Returns whether
    /// the entry was added.
    pub fn insert_if_absent(&mut self, entry: AclEntry) -> bool {
        match self.entries.entry(entry.key()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, key: &EntryKey) -> Option<&AclEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, entry: &AclEntry) -> bool {
        self.entries.contains_key(&entry.key())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AclEntry> {
        self.entries.values()
    }

    /// Entries matching `pred`, as a new set.
    pub fn filtered(&self, pred: impl Fn(&AclEntry) -> bool) -> AclSet {
        self.iter().filter(|e| pred(e)).cloned().collect()
    }

    pub fn specials(&self) -> AclSet {
        self.filtered(AclEntry::is_special)
    }

    pub fn defaults(&self) -> AclSet {
        self.filtered(AclEntry::is_default)
    }

    pub fn recursive(&self) -> AclSet {
        self.filtered(AclEntry::is_recursive)
    }

    pub fn has_recursive(&self) -> bool {
        self.iter().any(AclEntry::is_recursive)
    }
}

impl Extend<AclEntry> for AclSet {
    fn extend<I: IntoIterator<Item = AclEntry>>(&mut self, iter: I) {
        for entry in iter {
            self.insert(entry);
        }
    }
}

impl FromIterator<AclEntry> for AclSet {
    fn from_iter<I: IntoIterator<Item = AclEntry>>(iter: I) -> Self {
        let mut set = AclSet::new();
        set.extend(iter);
        set
    }
}

impl IntoIterator for AclSet {
    type Item = AclEntry;
    type IntoIter = std::collections::btree_map::IntoValues<EntryKey, AclEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

fn compact(value: &serde_yaml::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
}
