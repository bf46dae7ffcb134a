//! Domain hierarchy
//!
//! Domains form a forest. Nodes are kept in an arena keyed by id with only
//! an upward `parent` link; children and descendants are derived on demand.
//! Acyclicity is enforced when a parent is assigned, so reads only bound
//! their walks and report a corrupted store instead of looping.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::{
    error::{AppError, AppResult, InvariantError},
    models::{Domain, DomainId},
};

/// Snapshot of the parent links of every domain
#[derive(Debug, Clone, Default)]
pub struct DomainHierarchy {
    parents: BTreeMap<DomainId, Option<DomainId>>,
}

impl DomainHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_domains<'a>(domains: impl IntoIterator<Item = &'a Domain>) -> Self {
        Self {
            parents: domains.into_iter().map(|d| (d.id, d.parent_id)).collect(),
        }
    }

    /// Register a node without checking its parent link
    pub fn insert(&mut self, id: DomainId, parent: Option<DomainId>) {
        self.parents.insert(id, parent);
    }

    pub fn remove(&mut self, id: DomainId) {
        self.parents.remove(&id);
    }

    pub fn contains(&self, id: DomainId) -> bool {
        self.parents.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn parent(&self, id: DomainId) -> Option<DomainId> {
        self.parents.get(&id).copied().flatten()
    }

    /// Parent chain of `id`, nearest first. Empty for roots and unknown ids.
    pub fn ancestors(&self, id: DomainId) -> Result<Vec<DomainId>, InvariantError> {
        let mut chain = Vec::new();
        let mut current = self.parent(id);
        while let Some(node) = current {
            // a chain longer than the arena can only come from a cycle
            if chain.len() >= self.parents.len() {
                return Err(InvariantError::CorruptedHierarchy { domain_id: id });
            }
            chain.push(node);
            current = self.parent(node);
        }
        Ok(chain)
    }

    /// True iff `a` is somewhere in `b`'s parent chain. Never true for `a == b`.
    pub fn is_ancestor(&self, a: DomainId, b: DomainId) -> Result<bool, InvariantError> {
        if a == b {
            return Ok(false);
        }
        let mut steps = 0;
        let mut current = self.parent(b);
        while let Some(node) = current {
            if node == a {
                return Ok(true);
            }
            steps += 1;
            if steps > self.parents.len() {
                return Err(InvariantError::CorruptedHierarchy { domain_id: b });
            }
            current = self.parent(node);
        }
        Ok(false)
    }

    /// Direct children of `id`, in id order
    pub fn children(&self, id: DomainId) -> Vec<DomainId> {
        self.parents
            .iter()
            .filter(|(_, parent)| **parent == Some(id))
            .map(|(child, _)| *child)
            .collect()
    }

    /// Every node below `id`, breadth first
    pub fn descendants(&self, id: DomainId) -> Vec<DomainId> {
        let mut children: BTreeMap<DomainId, Vec<DomainId>> = BTreeMap::new();
        for (child, parent) in &self.parents {
            if let Some(parent) = parent {
                children.entry(*parent).or_default().push(*child);
            }
        }

        let mut seen = BTreeSet::from([id]);
        let mut result = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(node) = queue.pop_front() {
            for child in children.get(&node).into_iter().flatten() {
                if seen.insert(*child) {
                    result.push(*child);
                    queue.push_back(*child);
                }
            }
        }
        result
    }

    /// Nodes without a parent
    pub fn roots(&self) -> Vec<DomainId> {
        self.parents
            .iter()
            .filter(|(_, parent)| parent.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Nodes that are nobody's parent
    pub fn leaves(&self) -> Vec<DomainId> {
        let parents: BTreeSet<DomainId> = self.parents.values().flatten().copied().collect();
        self.parents
            .keys()
            .filter(|id| !parents.contains(id))
            .copied()
            .collect()
    }

    /// Given domains plus every ancestor of each
    pub fn closure(
        &self,
        domains: impl IntoIterator<Item = DomainId>,
    ) -> Result<BTreeSet<DomainId>, InvariantError> {
        let mut result = BTreeSet::new();
        for id in domains {
            if result.insert(id) {
                result.extend(self.ancestors(id)?);
            }
        }
        Ok(result)
    }

    /// Check that `node` may be moved under `new_parent`
    pub fn check_parent(
        &self,
        node: DomainId,
        new_parent: Option<DomainId>,
    ) -> Result<(), InvariantError> {
        let Some(parent) = new_parent else {
            return Ok(());
        };
        if parent == node || self.is_ancestor(node, parent)? {
            return Err(InvariantError::Cycle {
                domain_id: node,
                parent_id: parent,
            });
        }
        Ok(())
    }

    /// Move `node` under `new_parent` after checking for cycles
    pub fn set_parent(
        &mut self,
        node: DomainId,
        new_parent: Option<DomainId>,
    ) -> Result<(), InvariantError> {
        self.check_parent(node, new_parent)?;
        self.parents.insert(node, new_parent);
        Ok(())
    }

    /// A domain can only be deleted when nothing hangs off it
    pub fn check_delete(&self, id: DomainId, attached_books: i64) -> Result<(), InvariantError> {
        let children = self.children(id).len();
        if children > 0 || attached_books > 0 {
            return Err(InvariantError::DomainInUse {
                domain_id: id,
                books: attached_books,
                children,
            });
        }
        Ok(())
    }

    /// Validate the domain set of a book before it is committed
    pub fn check_assignment(&self, domains: &[DomainId], max_domains: u32) -> AppResult<()> {
        if domains.is_empty() {
            return Err(AppError::Validation(
                "A book needs at least one domain".to_string(),
            ));
        }
        let unique: BTreeSet<DomainId> = domains.iter().copied().collect();
        if unique.len() != domains.len() {
            return Err(AppError::Validation(
                "A domain is listed more than once".to_string(),
            ));
        }
        if unique.len() > max_domains as usize {
            return Err(InvariantError::TooManyDomains {
                count: unique.len(),
                max: max_domains,
            }
            .into());
        }
        if let Some(missing) = unique.iter().find(|id| !self.contains(**id)) {
            return Err(AppError::NotFound(format!("Domain with id {} not found", missing)));
        }
        Ok(self.check_unrelated(domains)?)
    }

    /// No domain of the set may lie above another one
    pub fn check_unrelated(&self, domains: &[DomainId]) -> Result<(), InvariantError> {
        for a in domains {
            for b in domains {
                if self.is_ancestor(*a, *b)? {
                    return Err(InvariantError::RelatedDomains {
                        ancestor: *a,
                        descendant: *b,
                    });
                }
            }
        }
        Ok(())
    }

    /// Check that `node` may be moved under `new_parent` given the domain
    /// sets books are filed under. The move is refused if it would create a
    /// cycle, or relate two domains of one book.
    pub fn check_move<'a>(
        &self,
        node: DomainId,
        new_parent: Option<DomainId>,
        filings: impl IntoIterator<Item = &'a [DomainId]>,
    ) -> Result<(), InvariantError> {
        let mut moved = self.clone();
        moved.set_parent(node, new_parent)?;

        let mut subtree = moved.descendants(node);
        subtree.push(node);
        for domains in filings {
            if domains.iter().any(|d| subtree.contains(d)) {
                moved.check_unrelated(domains)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1 Science
    // ├── 2 Physics
    // │   └── 4 Optics
    // └── 3 Biology
    // 5 Literature
    fn sample() -> DomainHierarchy {
        let mut h = DomainHierarchy::new();
        h.insert(1, None);
        h.insert(2, Some(1));
        h.insert(3, Some(1));
        h.insert(4, Some(2));
        h.insert(5, None);
        h
    }

    #[test]
    fn test_is_ancestor() {
        let h = sample();
        assert!(h.is_ancestor(1, 4).unwrap());
        assert!(h.is_ancestor(2, 4).unwrap());
        assert!(!h.is_ancestor(4, 1).unwrap());
        assert!(!h.is_ancestor(3, 4).unwrap());
        assert!(!h.is_ancestor(5, 4).unwrap());
    }

    #[test]
    fn test_node_is_not_its_own_ancestor() {
        let h = sample();
        for id in 1..=5 {
            assert!(!h.is_ancestor(id, id).unwrap());
        }
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let h = sample();
        assert_eq!(h.ancestors(4).unwrap(), vec![2, 1]);
        assert!(h.ancestors(1).unwrap().is_empty());
        assert!(h.ancestors(99).unwrap().is_empty());
        assert_eq!(h.descendants(1), vec![2, 3, 4]);
        assert!(h.descendants(4).is_empty());
        assert!(h.descendants(99).is_empty());
    }

    #[test]
    fn test_roots_and_leaves() {
        let h = sample();
        assert_eq!(h.roots(), vec![1, 5]);
        assert_eq!(h.leaves(), vec![3, 4, 5]);
    }

    #[test]
    fn test_set_parent_rejects_cycles() {
        let mut h = sample();
        assert_eq!(
            h.set_parent(1, Some(4)),
            Err(InvariantError::Cycle { domain_id: 1, parent_id: 4 })
        );
        assert!(h.set_parent(2, Some(2)).is_err());
        // moving a subtree elsewhere is fine
        h.set_parent(2, Some(5)).unwrap();
        assert_eq!(h.ancestors(4).unwrap(), vec![2, 5]);
        h.set_parent(2, None).unwrap();
        assert!(h.roots().contains(&2));
    }

    #[test]
    fn test_corrupted_store_fails_loudly() {
        let mut h = DomainHierarchy::new();
        h.insert(1, Some(2));
        h.insert(2, Some(1));
        h.insert(3, Some(1));
        assert_eq!(
            h.ancestors(3),
            Err(InvariantError::CorruptedHierarchy { domain_id: 3 })
        );
        assert!(h.is_ancestor(9, 3).is_err());
    }

    #[test]
    fn test_closure_includes_ancestors() {
        let h = sample();
        let closure = h.closure([4, 3]).unwrap();
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_check_delete() {
        let h = sample();
        assert!(matches!(
            h.check_delete(2, 0),
            Err(InvariantError::DomainInUse { children: 1, .. })
        ));
        assert!(h.check_delete(4, 1).is_err());
        assert!(h.check_delete(4, 0).is_ok());
    }

    #[test]
    fn test_check_assignment() {
        let h = sample();
        assert!(h.check_assignment(&[4, 3], 3).is_ok());
        assert!(matches!(
            h.check_assignment(&[1, 4], 3),
            Err(AppError::Invariant(InvariantError::RelatedDomains { ancestor: 1, descendant: 4 }))
        ));
        assert!(matches!(
            h.check_assignment(&[3, 4, 5], 2),
            Err(AppError::Invariant(InvariantError::TooManyDomains { count: 3, max: 2 }))
        ));
        assert!(matches!(h.check_assignment(&[], 3), Err(AppError::Validation(_))));
        assert!(matches!(h.check_assignment(&[42], 3), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_check_move_keeps_book_domains_unrelated() {
        let h = sample();
        let filed: [&[DomainId]; 2] = [&[4, 5], &[3]];

        // Literature under Optics would put 4 above 5
        assert_eq!(
            h.check_move(5, Some(4), filed),
            Err(InvariantError::RelatedDomains { ancestor: 4, descendant: 5 })
        );
        // Literature under Biology relates nothing a book carries together
        assert!(h.check_move(5, Some(3), filed).is_ok());
        // cycles are still refused first
        assert!(matches!(
            h.check_move(1, Some(4), filed),
            Err(InvariantError::Cycle { .. })
        ));
        // Physics under Literature relates 4 to 5 the other way round
        assert_eq!(
            h.check_move(2, Some(5), filed),
            Err(InvariantError::RelatedDomains { ancestor: 5, descendant: 4 })
        );
    }
}
