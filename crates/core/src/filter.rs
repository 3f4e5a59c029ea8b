//! Category filter: which nodes a view shows for a given mask

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::classify::{Change, Direction, SyncKind};
use crate::tree::{DiffTree, NodeId};

/// Set of categories a view shows
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FilterMask(u8);

impl FilterMask {
    pub const NONE: Self = Self(0);
    pub const SHOW_INCOMING: Self = Self(1);
    pub const SHOW_OUTGOING: Self = Self(2);
    pub const SHOW_CONFLICTS: Self = Self(4);
    pub const SHOW_PSEUDO_CONFLICTS: Self = Self(8);
    pub const ALL: Self = Self(15);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Mask for a synchronization mode and the view toggles.
    ///
    /// Conflicts are always part of the mask. Pseudo conflicts are shown
    /// unless local and remote are compared by content, where an identical
    /// result is not worth a look.
    #[must_use]
    pub fn for_mode(mode: SyncMode, toggles: FilterToggles) -> Self {
        let mut mask = Self::SHOW_CONFLICTS;
        if !toggles.conflicts_only {
            match mode {
                SyncMode::Incoming | SyncMode::Merge => mask.insert(Self::SHOW_INCOMING),
                SyncMode::Outgoing => mask.insert(Self::SHOW_OUTGOING),
                SyncMode::Both => {
                    if toggles.incoming {
                        mask.insert(Self::SHOW_INCOMING);
                    }
                    if toggles.outgoing {
                        mask.insert(Self::SHOW_OUTGOING);
                    }
                }
                SyncMode::Compare => {
                    mask.insert(Self::SHOW_INCOMING);
                    mask.insert(Self::SHOW_OUTGOING);
                }
            }
        }
        if mode != SyncMode::Compare {
            mask.insert(Self::SHOW_PSEUDO_CONFLICTS);
        }
        mask
    }
}

impl BitOr for FilterMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FilterMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FilterMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SHOW_INCOMING, "INCOMING"),
            (Self::SHOW_OUTGOING, "OUTGOING"),
            (Self::SHOW_CONFLICTS, "CONFLICTS"),
            (Self::SHOW_PSEUDO_CONFLICTS, "PSEUDO_CONFLICTS"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "FilterMask({})", set.join(" | "))
    }
}

/// How the view was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Incoming,
    Outgoing,
    #[default]
    Both,
    /// Catching up with another version: only incoming matters
    Merge,
    /// Compare against a version without synchronizing
    Compare,
}

/// User toggles refining [`FilterMask::for_mode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterToggles {
    pub incoming: bool,
    pub outgoing: bool,
    pub conflicts_only: bool,
}

impl Default for FilterToggles {
    fn default() -> Self {
        Self {
            incoming: true,
            outgoing: true,
            conflicts_only: false,
        }
    }
}

/// Visibility of a single classification, ignoring descendants
#[must_use]
pub fn kind_visible(kind: SyncKind, mask: FilterMask) -> bool {
    if kind.is_pseudo_conflict() && !mask.contains(FilterMask::SHOW_PSEUDO_CONFLICTS) {
        return false;
    }
    match kind.direction() {
        Some(Direction::Conflicting) => true,
        Some(Direction::Incoming) => mask.contains(FilterMask::SHOW_INCOMING),
        Some(Direction::Outgoing) => mask.contains(FilterMask::SHOW_OUTGOING),
        None => kind.change() != Change::None,
    }
}

/// Whether `node` is shown under `mask`.
///
/// A folder is shown if any descendant is, or if its aggregated
/// classification is.
#[must_use]
pub fn is_visible(tree: &DiffTree, node: NodeId, mask: FilterMask) -> bool {
    let Ok(diff) = tree.node(node) else {
        return false;
    };
    if !diff.is_folder() {
        return kind_visible(diff.kind(), mask);
    }
    diff.children().iter().any(|c| is_visible(tree, *c, mask))
        || kind_visible(tree.aggregate(node), mask)
}

/// Visibility of every node, computed in one bottom-up pass.
///
/// The result stays valid until the mask or the tree generation changes;
/// [`VisibilityCache::get`] recomputes transparently when either does.
#[derive(Debug, Default)]
pub struct VisibilityCache {
    key: Option<(FilterMask, u64)>,
    visible: Vec<bool>,
}

impl VisibilityCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached pass
    pub fn invalidate(&mut self) {
        self.key = None;
        self.visible.clear();
    }

    /// Whether the cache currently holds a pass for `mask` over `tree`
    #[must_use]
    pub fn is_fresh(&self, tree: &DiffTree, mask: FilterMask) -> bool {
        self.key == Some((mask, tree.generation())) && self.visible.len() == tree.len()
    }

    pub fn get(&mut self, tree: &DiffTree, node: NodeId, mask: FilterMask) -> bool {
        if !self.is_fresh(tree, mask) {
            self.recompute(tree, mask);
        }
        self.visible.get(node.index()).copied().unwrap_or(false)
    }

    fn recompute(&mut self, tree: &DiffTree, mask: FilterMask) {
        let aggregates = tree.aggregate_all();
        let mut visible = vec![false; tree.len()];

        // Children always have larger ids than their parent
        for index in (0..tree.len()).rev() {
            let Ok(node) = tree.node(NodeId::from_index(index)) else {
                continue;
            };
            visible[index] = if node.is_folder() {
                node.children().iter().any(|c| visible[c.index()])
                    || kind_visible(aggregates[index], mask)
            } else {
                kind_visible(node.kind(), mask)
            };
        }

        self.visible = visible;
        self.key = Some((mask, tree.generation()));
    }
}
