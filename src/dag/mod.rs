//! DAG encoding: turns success/failure edge lists into per-step
//! preconditions, and provides the topological order `next_steps` needs.
//!
//! Parent/child edges are used only here, to build the flat
//! [`crate::rules::PreconditionTable`] and (optionally) a topological
//! ordering; per the "Cyclic object graphs" design note, nothing downstream
//! keeps a back-pointer between steps — the rule table only ever sees step
//! ids.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::rules::{PreconditionClause, PreconditionTable};
use crate::types::{State, StepId};

#[cfg(feature = "petgraph-compat")]
pub mod petgraph_compat;

/// The two edge sets the Manager is configured with.
///
/// `a -> b` in `success_edges` means "b may run after a succeeds or is
/// skipped"; `a -> b` in `failure_edges` means "b may run after a fails".
#[derive(Clone, Debug, Default)]
pub struct Dag {
    pub success_edges: Vec<(StepId, StepId)>,
    pub failure_edges: Vec<(StepId, StepId)>,
}

impl Dag {
    #[must_use]
    pub fn new(success_edges: Vec<(StepId, StepId)>, failure_edges: Vec<(StepId, StepId)>) -> Self {
        Dag {
            success_edges,
            failure_edges,
        }
    }

    /// Build the `Run`/`Skip` preconditions every target step needs:
    /// same-origin predecessors AND-merge into one clause, success- and
    /// failure-origin clauses are OR'd together.
    #[must_use]
    pub fn build_preconditions(&self) -> PreconditionTable {
        let mut success_parents: FxHashMap<StepId, Vec<StepId>> = FxHashMap::default();
        for (from, to) in &self.success_edges {
            success_parents.entry(*to).or_default().push(*from);
        }
        let mut failure_parents: FxHashMap<StepId, Vec<StepId>> = FxHashMap::default();
        for (from, to) in &self.failure_edges {
            failure_parents.entry(*to).or_default().push(*from);
        }

        let mut targets: FxHashSet<StepId> = FxHashSet::default();
        targets.extend(success_parents.keys().copied());
        targets.extend(failure_parents.keys().copied());

        let mut table = PreconditionTable::new();
        for target in targets {
            let mut clauses = Vec::new();
            if let Some(parents) = success_parents.get(&target) {
                let mut clause = PreconditionClause::default();
                for parent in parents {
                    clause.insert(*parent, vec![State::Succeeded, State::Skipped]);
                }
                clauses.push(clause);
            }
            if let Some(parents) = failure_parents.get(&target) {
                let mut clause = PreconditionClause::default();
                for parent in parents {
                    clause.insert(*parent, vec![State::Failed]);
                }
                clauses.push(clause);
            }
            table.set_run(target, clauses.clone());
            table.set_skip(target, clauses);
        }
        table
    }

    /// Deterministic topological order over the success-edge graph: Kahn's
    /// algorithm, ties broken by ascending step id so the same DAG always
    /// yields the same order. Steps that appear in neither edge set (no
    /// success predecessors or successors) are included, ordered by id
    /// alongside roots.
    ///
    /// Used by the `next_steps` operation (Design Notes, restored for
    /// operator parity) to pick which Paused steps to resume first.
    #[must_use]
    pub fn topological_order(&self, all_steps: &[StepId]) -> Vec<StepId> {
        let mut adjacency: FxHashMap<StepId, Vec<StepId>> = FxHashMap::default();
        let mut indegree: FxHashMap<StepId, usize> = all_steps.iter().map(|id| (*id, 0)).collect();

        for (from, to) in &self.success_edges {
            adjacency.entry(*from).or_default().push(*to);
            *indegree.entry(*to).or_insert(0) += 1;
            indegree.entry(*from).or_insert(0);
        }

        let mut ready: Vec<StepId> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(all_steps.len());
        let mut indegree = indegree;
        while let Some(next) = ready_pop(&mut ready) {
            order.push(next);
            if let Some(children) = adjacency.get(&next) {
                let mut newly_ready = Vec::new();
                for child in children {
                    if let Some(count) = indegree.get_mut(child) {
                        *count -= 1;
                        if *count == 0 {
                            newly_ready.push(*child);
                        }
                    }
                }
                newly_ready.sort();
                for child in newly_ready {
                    insert_sorted(&mut ready, child);
                }
            }
        }
        order
    }
}

fn ready_pop(ready: &mut Vec<StepId>) -> Option<StepId> {
    if ready.is_empty() {
        None
    } else {
        Some(ready.remove(0))
    }
}

fn insert_sorted(ready: &mut Vec<StepId>, value: StepId) {
    let pos = ready.partition_point(|existing| *existing < value);
    ready.insert(pos, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_preconditions_require_predecessor_success_or_skip() {
        let a = StepId(0);
        let b = StepId(1);
        let dag = Dag::new(vec![(a, b)], vec![]);
        let table = dag.build_preconditions();
        let preconditions = table.preconditions_for(b, crate::types::Action::Run).unwrap();
        assert_eq!(preconditions.len(), 1);
        assert_eq!(
            preconditions[0].get(&a),
            Some(&vec![State::Succeeded, State::Skipped])
        );
    }

    #[test]
    fn diamond_and_merges_success_predecessors() {
        let a = StepId(0);
        let b = StepId(1);
        let c = StepId(2);
        let d = StepId(3);
        let dag = Dag::new(vec![(a, b), (a, c), (b, d), (c, d)], vec![]);
        let table = dag.build_preconditions();
        let preconditions = table.preconditions_for(d, crate::types::Action::Run).unwrap();
        assert_eq!(preconditions.len(), 1);
        assert_eq!(preconditions[0].len(), 2);
        assert!(preconditions[0].contains_key(&b));
        assert!(preconditions[0].contains_key(&c));
    }

    #[test]
    fn success_and_failure_parentage_are_separate_clauses() {
        let a = StepId(0);
        let c = StepId(1);
        let b = StepId(2);
        let dag = Dag::new(vec![(a, b)], vec![(c, b)]);
        let table = dag.build_preconditions();
        let preconditions = table.preconditions_for(b, crate::types::Action::Run).unwrap();
        assert_eq!(preconditions.len(), 2);
    }

    #[test]
    fn topological_order_is_deterministic_for_diamond() {
        let a = StepId(0);
        let b = StepId(1);
        let c = StepId(2);
        let d = StepId(3);
        let dag = Dag::new(vec![(a, b), (a, c), (b, d), (c, d)], vec![]);
        let order = dag.topological_order(&[a, b, c, d]);
        assert_eq!(order, vec![a, b, c, d]);
    }
}
