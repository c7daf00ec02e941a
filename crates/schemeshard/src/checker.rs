//! Fluent validation of resolved paths.
//!
//! ```ignore
//! PathChecker::new(&state, &src)
//!     .not_empty()
//!     .is_resolved()
//!     .is_table()
//!     .not_under_operation()
//!     .into_result()?;
//! ```
//!
//! The first failing check wins; later checks are skipped.

use crate::error::ProposeError;
use crate::path::{PathElement, ResolvedPath, SchemeState};
use strata_types::{PathType, SchemeStatus, TxId};

pub struct PathChecker<'a> {
    state: &'a SchemeState,
    path: &'a ResolvedPath,
    failure: Option<ProposeError>,
}

impl<'a> PathChecker<'a> {
    pub fn new(state: &'a SchemeState, path: &'a ResolvedPath) -> Self {
        Self {
            state,
            path,
            failure: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_result(self) -> Result<(), ProposeError> {
        match self.failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn entry(&self) -> Option<&'a PathElement> {
        self.path.base().and_then(|id| self.state.path(id))
    }

    /// Apply `check` unless an earlier one already failed.
    fn check(mut self, check: impl FnOnce(&Self) -> Option<ProposeError>) -> Self {
        if self.failure.is_none() {
            self.failure = check(&self);
        }
        self
    }

    /// Like [`check`](Self::check) for checks that need the entry; an
    /// unresolved path fails with `PathDoesNotExist`.
    fn check_entry(self, check: impl FnOnce(&PathElement, &str) -> Option<ProposeError>) -> Self {
        self.check(|c| match c.entry() {
            Some(entry) => check(entry, &c.path.text),
            None => Some(ProposeError::new(
                SchemeStatus::PathDoesNotExist,
                format!("path does not exist, path: {}", c.path.text),
            )),
        })
    }

    pub fn not_empty(self) -> Self {
        self.check(|c| {
            c.path.is_empty().then(|| {
                ProposeError::new(SchemeStatus::InvalidParameter, "path is empty")
            })
        })
    }

    pub fn is_resolved(self) -> Self {
        self.check_entry(|_, _| None)
    }

    pub fn not_resolved(self) -> Self {
        self.check(|c| {
            c.entry().map(|entry| {
                ProposeError::new(
                    SchemeStatus::AlreadyExists,
                    format!("path exists, path: {}", c.path.text),
                )
                .with_path_id(entry.path_id)
            })
        })
    }

    pub fn not_deleted(self) -> Self {
        self.check_entry(|entry, text| {
            entry.is_deleted().then(|| {
                ProposeError::new(
                    SchemeStatus::PathDoesNotExist,
                    format!("path is deleted, path: {text}"),
                )
            })
        })
    }

    pub fn is_table(self) -> Self {
        self.check_entry(|entry, text| {
            (!entry.is_table()).then(|| {
                ProposeError::new(
                    SchemeStatus::PathNotTable,
                    format!("path is not a table, path: {text}"),
                )
            })
        })
    }

    pub fn is_directory(self) -> Self {
        self.check_entry(|entry, text| {
            (!entry.is_directory()).then(|| {
                ProposeError::new(
                    SchemeStatus::PathIsNotDirectory,
                    format!("path is not a directory, path: {text}"),
                )
            })
        })
    }

    pub fn not_under_operation(self) -> Self {
        self.check_entry(|entry, text| {
            entry.is_under_operation().then(|| {
                ProposeError::new(
                    SchemeStatus::MultipleModifications,
                    format!(
                        "path is under operation, path: {text}, state: {:?}, tx: {:?}",
                        entry.state, entry.last_tx_id
                    ),
                )
            })
        })
    }

    pub fn not_under_the_same_operation(self, tx_id: TxId) -> Self {
        self.check_entry(|entry, text| {
            entry.is_under_the_same_operation(tx_id).then(|| {
                ProposeError::new(
                    SchemeStatus::MultipleModifications,
                    format!("path is already under the same operation {tx_id}, path: {text}"),
                )
            })
        })
    }

    pub fn is_under_the_same_operation(self, tx_id: TxId) -> Self {
        self.check_entry(|entry, text| {
            (!entry.is_under_the_same_operation(tx_id)).then(|| {
                ProposeError::new(
                    SchemeStatus::MultipleModifications,
                    format!("path is under another operation {:?}, path: {text}", entry.last_tx_id),
                )
            })
        })
    }

    pub fn is_under_deleting(self) -> Self {
        self.check_entry(|entry, text| {
            (!entry.is_under_deleting()).then(|| {
                ProposeError::new(
                    SchemeStatus::MultipleModifications,
                    format!("path is not being deleted, path: {text}"),
                )
            })
        })
    }

    pub fn is_under_moving(self) -> Self {
        self.check_entry(|entry, text| {
            (!entry.is_under_moving()).then(|| {
                ProposeError::new(
                    SchemeStatus::MultipleModifications,
                    format!("path is not being moved, path: {text}"),
                )
            })
        })
    }

    pub fn is_under_creating(self) -> Self {
        self.check_entry(|entry, text| {
            (!entry.is_under_creating()).then(|| {
                ProposeError::new(
                    SchemeStatus::MultipleModifications,
                    format!("path is not being created, path: {text}"),
                )
            })
        })
    }

    /// An existing entry is always `AlreadyExists`. When `accept_existing`
    /// and the entry has the expected type, its id is reported too so the
    /// caller can recognize its own earlier request.
    pub fn fail_on_exist(self, expected: PathType, accept_existing: bool) -> Self {
        self.check_entry(|entry, text| {
            if entry.is_under_operation() {
                return Some(ProposeError::new(
                    SchemeStatus::MultipleModifications,
                    format!("path exists and is under operation, path: {text}"),
                ));
            }
            let error = ProposeError::new(
                SchemeStatus::AlreadyExists,
                format!("path exist, request accepts it: {accept_existing}, path: {text}"),
            );
            if accept_existing && entry.path_type == expected {
                Some(error.with_path_id(entry.path_id))
            } else {
                Some(error)
            }
        })
    }

    pub fn depth_limit(self, max_depth: usize) -> Self {
        self.check(|c| {
            (c.path.depth() > max_depth).then(|| {
                ProposeError::new(
                    SchemeStatus::SchemeError,
                    format!(
                        "path is too deep, path: {}, depth: {}, limit: {max_depth}",
                        c.path.text,
                        c.path.depth()
                    ),
                )
            })
        })
    }

    pub fn is_valid_leaf_name(self, max_length: usize) -> Self {
        self.check(|c| {
            let name = c.path.leaf_name().unwrap_or_default();
            let valid = !name.is_empty()
                && name.len() <= max_length
                && name
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
            (!valid).then(|| {
                ProposeError::new(
                    SchemeStatus::SchemeError,
                    format!("invalid name '{name}', path: {}", c.path.text),
                )
            })
        })
    }
}
