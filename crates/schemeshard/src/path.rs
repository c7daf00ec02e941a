//! Namespace tree, shard ownership and table descriptions.
//!
//! [`SchemeState`] is everything the scheme shard keeps in memory. Its maps
//! are `im::OrdMap`s so a request can snapshot the whole state with one
//! cheap clone and roll back to it when a later part fails validation.

use crate::tx_state::TxState;
use im::OrdMap;
use sbor::prelude::BasicSbor;
use std::collections::BTreeMap;
use strata_types::{
    OperationId, PathId, PathState, PathType, PlanStep, ShardIdx, TableSchema, TabletId, TxId,
};

/// One namespace entry.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PathElement {
    pub path_id: PathId,
    /// The root is its own parent.
    pub parent: PathId,
    pub name: String,
    pub path_type: PathType,
    pub state: PathState,
    pub created_tx: Option<TxId>,
    /// Operation that last took the entry under modification.
    pub last_tx_id: Option<TxId>,
    pub drop_tx_id: Option<TxId>,
    /// Bumped whenever the entry or its list of children changes. Published
    /// to the name cache and matched by `ApplyIf` preconditions.
    pub dir_alter_version: u64,
    pub step_created: Option<PlanStep>,
    pub step_dropped: Option<PlanStep>,
    /// Live children by name. A name reused inside one transaction points at
    /// the newest entry; the entry it displaced becomes inactive.
    pub children: BTreeMap<String, PathId>,
}

impl PathElement {
    pub fn new(path_id: PathId, parent: PathId, name: impl Into<String>, path_type: PathType) -> Self {
        Self {
            path_id,
            parent,
            name: name.into(),
            path_type,
            state: PathState::NoChanges,
            created_tx: None,
            last_tx_id: None,
            drop_tx_id: None,
            dir_alter_version: 1,
            step_created: None,
            step_dropped: None,
            children: BTreeMap::new(),
        }
    }

    pub fn root() -> Self {
        let mut root = Self::new(PathId::ROOT, PathId::ROOT, "", PathType::Directory);
        root.step_created = Some(PlanStep(0));
        root
    }

    pub fn is_root(&self) -> bool {
        self.path_id == PathId::ROOT
    }

    pub fn is_directory(&self) -> bool {
        self.path_type == PathType::Directory
    }

    pub fn is_table(&self) -> bool {
        self.path_type == PathType::Table
    }

    pub fn is_deleted(&self) -> bool {
        self.state == PathState::NotExist || self.step_dropped.is_some()
    }

    pub fn is_under_operation(&self) -> bool {
        matches!(
            self.state,
            PathState::Create | PathState::Drop | PathState::Moving
        )
    }

    pub fn is_under_creating(&self) -> bool {
        self.state == PathState::Create
    }

    pub fn is_under_deleting(&self) -> bool {
        self.state == PathState::Drop
    }

    pub fn is_under_moving(&self) -> bool {
        self.state == PathState::Moving
    }

    pub fn is_under_the_same_operation(&self, tx_id: TxId) -> bool {
        self.is_under_operation() && self.last_tx_id == Some(tx_id)
    }
}

/// Ownership record of one data shard.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ShardInfo {
    pub idx: ShardIdx,
    pub tablet_id: TabletId,
    /// Table the shard serves.
    pub path_id: PathId,
    /// Operation holding the shard, if any.
    pub current_tx_id: Option<TxId>,
}

/// Scheme shard view of a table.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct TableInfo {
    pub path_id: PathId,
    pub schema: TableSchema,
    /// Schema version the hosting data shards agree on.
    pub alter_version: u64,
    pub partitions: Vec<ShardIdx>,
}

/// A path string resolved as far as the namespace allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub text: String,
    pub parts: Vec<String>,
    /// Entries matched from the root down. Always starts with the root.
    pub chain: Vec<PathId>,
}

impl ResolvedPath {
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn is_resolved(&self) -> bool {
        self.chain.len() == self.parts.len() + 1
    }

    /// The entry the whole path names, when resolved.
    pub fn base(&self) -> Option<PathId> {
        if self.is_resolved() {
            self.chain.last().copied()
        } else {
            None
        }
    }

    pub fn depth(&self) -> usize {
        self.parts.len()
    }

    pub fn leaf_name(&self) -> Option<&str> {
        self.parts.last().map(String::as_str)
    }

    /// The enclosing path. The parent of the root is the root.
    pub fn parent(&self) -> ResolvedPath {
        let mut parts = self.parts.clone();
        parts.pop();
        let mut chain = self.chain.clone();
        chain.truncate(parts.len() + 1);
        ResolvedPath {
            text: format!("/{}", parts.join("/")),
            parts,
            chain,
        }
    }
}

/// In-memory state of the scheme shard.
#[derive(Debug, Clone)]
pub struct SchemeState {
    pub paths: OrdMap<PathId, PathElement>,
    pub shards: OrdMap<ShardIdx, ShardInfo>,
    pub tables: OrdMap<PathId, TableInfo>,
    pub tx_states: OrdMap<OperationId, TxState>,
    pub next_path_id: u64,
    pub next_shard_idx: u64,
}

impl Default for SchemeState {
    fn default() -> Self {
        Self {
            paths: OrdMap::new(),
            shards: OrdMap::new(),
            tables: OrdMap::new(),
            tx_states: OrdMap::new(),
            next_path_id: PathId::ROOT.0 + 1,
            next_shard_idx: 1,
        }
    }
}

impl SchemeState {
    pub fn path(&self, path_id: PathId) -> Option<&PathElement> {
        self.paths.get(&path_id)
    }

    /// Mutable access to an entry that must exist.
    pub fn path_mut(&mut self, path_id: PathId) -> &mut PathElement {
        self.paths
            .get_mut(&path_id)
            .unwrap_or_else(|| panic!("path {path_id} is not in the namespace"))
    }

    pub fn shard_mut(&mut self, idx: ShardIdx) -> &mut ShardInfo {
        self.shards
            .get_mut(&idx)
            .unwrap_or_else(|| panic!("{idx} is not owned by this scheme shard"))
    }

    pub fn allocate_path_id(&mut self) -> PathId {
        let id = PathId(self.next_path_id);
        self.next_path_id += 1;
        id
    }

    pub fn allocate_shard_idx(&mut self) -> ShardIdx {
        let idx = ShardIdx(self.next_shard_idx);
        self.next_shard_idx += 1;
        idx
    }

    /// Add `element` and make it the live child of its parent under its
    /// name.
    pub fn insert_path(&mut self, element: PathElement) {
        let path_id = element.path_id;
        let parent = element.parent;
        let name = element.name.clone();
        self.paths.insert(path_id, element);
        if path_id != parent {
            self.path_mut(parent).children.insert(name, path_id);
        }
    }

    /// Walk `text` from the root through live children.
    pub fn resolve(&self, text: &str) -> ResolvedPath {
        let parts: Vec<String> = text
            .split('/')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        let mut chain = vec![PathId::ROOT];
        let mut current = self.paths.get(&PathId::ROOT);
        for part in &parts {
            let Some(child) = current.and_then(|entry| entry.children.get(part)) else {
                break;
            };
            chain.push(*child);
            current = self.paths.get(child);
        }
        ResolvedPath {
            text: text.to_string(),
            parts,
            chain,
        }
    }

    /// Absolute path of an entry, following parent links.
    pub fn path_string(&self, path_id: PathId) -> String {
        let mut names = Vec::new();
        let mut current = path_id;
        while current != PathId::ROOT {
            let Some(entry) = self.paths.get(&current) else {
                break;
            };
            names.push(entry.name.as_str());
            current = entry.parent;
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Whether the parent still resolves the entry's name to the entry.
    pub fn is_active(&self, path_id: PathId) -> bool {
        self.paths.get(&path_id).is_some_and(|entry| {
            self.paths
                .get(&entry.parent)
                .and_then(|parent| parent.children.get(&entry.name))
                == Some(&path_id)
        })
    }

    /// Parts of `tx_id` still in flight.
    pub fn parts_of(&self, tx_id: TxId) -> Vec<OperationId> {
        self.tx_states
            .keys()
            .filter(|op| op.tx_id == tx_id)
            .copied()
            .collect()
    }
}
