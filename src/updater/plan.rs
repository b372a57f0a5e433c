//! Reconciliation plan builder
//!
//! Pure partitioning of desired and observed objects (both keyed by name)
//! into adds, patches and removals.

use std::collections::BTreeMap;

use crate::updater::desired::ResourceKind;

/// An object to patch, with both sides kept for computing the patch body
#[derive(Clone, Debug)]
pub struct PatchPair<K> {
    pub observed: K,
    pub desired: K,
}

/// Operations required to converge one kind
#[derive(Clone, Debug)]
pub struct ReconciliationPlan<K> {
    pub to_add: Vec<K>,
    pub to_patch: Vec<PatchPair<K>>,
    pub to_remove: Vec<String>,
    pub unchanged: Vec<String>,
}

impl<K> Default for ReconciliationPlan<K> {
    fn default() -> Self {
        Self {
            to_add: Vec::new(),
            to_patch: Vec::new(),
            to_remove: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

impl<K> ReconciliationPlan<K> {
    /// True when the plan performs no mutation
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_patch.is_empty() && self.to_remove.is_empty()
    }
}

/// Names-only view of a plan, handed to observers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanSummary {
    pub kind: ResourceKind,
    pub add: Vec<String>,
    pub patch: Vec<String>,
    pub remove: Vec<String>,
    pub unchanged: Vec<String>,
}

impl PlanSummary {
    pub fn empty(kind: ResourceKind) -> Self {
        Self {
            kind,
            add: Vec::new(),
            patch: Vec::new(),
            remove: Vec::new(),
            unchanged: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.patch.is_empty() && self.remove.is_empty()
    }
}

/// Partition names into add/patch/remove.
///
/// A name present on both sides is patched when `force` is set or `drifted`
/// reports a difference, and is never removed. Output follows name order.
pub fn build_plan<K, F>(
    desired: BTreeMap<String, K>,
    mut observed: BTreeMap<String, K>,
    force: bool,
    drifted: F,
) -> ReconciliationPlan<K>
where
    F: Fn(&K, &K) -> bool,
{
    let mut plan = ReconciliationPlan::default();

    for (name, want) in desired {
        match observed.remove(&name) {
            None => plan.to_add.push(want),
            Some(have) => {
                if force || drifted(&want, &have) {
                    plan.to_patch.push(PatchPair {
                        observed: have,
                        desired: want,
                    });
                } else {
                    plan.unchanged.push(name);
                }
            }
        }
    }
    plan.to_remove = observed.into_keys().collect();
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn map(entries: &[(&str, i32)]) -> BTreeMap<String, i32> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_partition() {
        let desired = map(&[("a", 1), ("b", 2), ("c", 3)]);
        let observed = map(&[("b", 2), ("c", 9), ("d", 4)]);
        let plan = build_plan(desired, observed, false, |w, h| w != h);

        assert_eq!(plan.to_add, vec![1]);
        assert_eq!(plan.to_patch.len(), 1);
        assert_eq!(plan.to_patch[0].desired, 3);
        assert_eq!(plan.to_patch[0].observed, 9);
        assert_eq!(plan.to_remove, vec!["d".to_string()]);
        assert_eq!(plan.unchanged, vec!["b".to_string()]);
    }

    #[test]
    fn test_force_patches_every_shared_name() {
        let desired = map(&[("a", 1), ("b", 2)]);
        let observed = map(&[("a", 1), ("b", 2)]);
        let plan = build_plan(desired, observed, true, |_, _| false);
        assert_eq!(plan.to_patch.len(), 2);
        assert!(plan.unchanged.is_empty());
    }

    #[test]
    fn test_identical_sets_are_noop() {
        let desired = map(&[("a", 1), ("b", 2)]);
        let plan = build_plan(desired.clone(), desired, false, |w, h| w != h);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_sets_are_disjoint_and_cover_both_sides() {
        let desired = map(&[("x", 1), ("y", 2), ("z", 3)]);
        let observed = map(&[("w", 0), ("y", 5), ("z", 3)]);
        let desired_names: BTreeSet<_> = desired.keys().cloned().collect();
        let observed_names: BTreeSet<_> = observed.keys().cloned().collect();

        let plan = build_plan(desired, observed, false, |w, h| w != h);
        let add: BTreeSet<String> = ["x".to_string()].into();
        let patch: BTreeSet<String> = ["y".to_string()].into();
        let remove: BTreeSet<String> = plan.to_remove.iter().cloned().collect();

        assert_eq!(plan.to_add.len(), add.len());
        assert_eq!(plan.to_patch.len(), patch.len());
        assert!(remove.is_disjoint(&desired_names));
        assert_eq!(
            remove,
            observed_names.difference(&desired_names).cloned().collect()
        );
    }
}
