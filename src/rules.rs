//! The step state machine: the default rule table and precondition
//! evaluation.
//!
//! The rule table itself is uniform across all steps (§4.1) — only the
//! *preconditions* attached to `Run` and `Skip` differ per step, and those
//! come from the DAG ([`crate::dag`]), not from here. This module is
//! therefore two things bolted together: a pure `(state, action) -> state`
//! function, and a precondition-satisfaction check over a states snapshot.

use rustc_hash::FxHashMap;

use crate::types::{Action, State, StepId};

/// A conjunctive clause: satisfied iff every listed step's current state is
/// in its allowed set. An empty clause is vacuously satisfied.
pub type PreconditionClause = FxHashMap<StepId, Vec<State>>;

/// A transition's full precondition: a disjunctive list of clauses.
/// Satisfied iff the list is empty or at least one clause holds.
pub type PreconditionList = Vec<PreconditionClause>;

/// Per-step preconditions for the two actions the DAG can constrain:
/// `Run` (from Waiting) and `Skip` (from To-Skip).
#[derive(Clone, Debug, Default)]
pub struct PreconditionTable {
    run: FxHashMap<StepId, PreconditionList>,
    skip: FxHashMap<StepId, PreconditionList>,
}

impl PreconditionTable {
    #[must_use]
    pub fn new() -> Self {
        PreconditionTable::default()
    }

    pub fn set_run(&mut self, step: StepId, preconditions: PreconditionList) {
        self.run.insert(step, preconditions);
    }

    pub fn set_skip(&mut self, step: StepId, preconditions: PreconditionList) {
        self.skip.insert(step, preconditions);
    }

    /// The preconditions attached to `action` for `step`, if any. An action
    /// other than `Run`/`Skip`, or a step with no entry, has no
    /// preconditions (trivially satisfied).
    #[must_use]
    pub fn preconditions_for(&self, step: StepId, action: Action) -> Option<&PreconditionList> {
        match action {
            Action::Run => self.run.get(&step),
            Action::Skip => self.skip.get(&step),
            _ => None,
        }
    }
}

/// Returns `true` iff every entry in `clause` names a step whose current
/// state (per `states`) is in the clause's allowed set.
#[must_use]
pub fn is_clause_satisfied(clause: &PreconditionClause, states: &FxHashMap<StepId, State>) -> bool {
    clause.iter().all(|(step, allowed)| {
        states
            .get(step)
            .map(|current| allowed.contains(current))
            .unwrap_or(false)
    })
}

/// A precondition list is satisfied iff it is empty or any clause holds.
#[must_use]
pub fn is_precondition_satisfied(list: &PreconditionList, states: &FxHashMap<StepId, State>) -> bool {
    list.is_empty() || list.iter().any(|clause| is_clause_satisfied(clause, states))
}

/// The default, uniform rule table (§4.1): which action each state defines,
/// and the to-state it leads to. Pure and stateless — the same table applies
/// to every step; only preconditions vary per step.
pub struct RuleTable;

impl RuleTable {
    /// `transition(state, action)` — `None` if the pair is not in the rule
    /// set (the contract explicitly leaves this undefined; callers should
    /// only invoke it for actions present in `actions_from_state(state)`).
    #[must_use]
    pub fn transition(state: State, action: Action) -> Option<State> {
        use Action::*;
        use State::*;
        match (state, action) {
            (Ready, Start) => Some(Waiting),
            (Ready, MarkToSkip) => Some(ToSkip),
            (Ready, Pause) => Some(Paused),

            (Waiting, Run) => Some(Running),
            (Waiting, MarkToSkip) => Some(ToSkip),
            (Waiting, Pause) => Some(Paused),

            (Running, Succeed) => Some(Succeeded),
            (Running, Fail) => Some(Failed),
            (Running, Error) => Some(State::Error),
            (Running, Interrupt) => Some(Interrupted),

            (Paused, Resume) => Some(Waiting),
            (Paused, MarkToSkip) => Some(ToSkip),

            (State::Error, Rerun) => Some(Waiting),
            (State::Error, MarkToSkip) => Some(ToSkip),

            (Interrupted, Resume) => Some(Waiting),
            (Interrupted, MarkToSkip) => Some(ToSkip),

            (ToSkip, Skip) => Some(Skipped),
            (ToSkip, Unskip) => Some(Waiting),

            _ => None,
        }
    }

    /// The actions defined from `state`, ignoring preconditions. Terminal
    /// states (Succeeded, Failed, Skipped) define none.
    #[must_use]
    pub fn actions_from_state(state: State) -> &'static [Action] {
        use Action::*;
        use State::*;
        match state {
            Ready => &[Start, Pause, MarkToSkip],
            Waiting => &[Run, Pause, MarkToSkip],
            Running => &[Succeed, Fail, State::Error, Interrupt],
            Paused => &[Resume, MarkToSkip],
            State::Error => &[Rerun, MarkToSkip],
            Interrupted => &[Resume, MarkToSkip],
            ToSkip => &[Skip, Unskip],
            Succeeded | Failed | Skipped => &[],
        }
    }

    /// The available actions for `step` currently in `state`: every action
    /// the state defines whose precondition list (if any, from `table`) is
    /// satisfied against `states`.
    #[must_use]
    pub fn available_actions(
        step: StepId,
        state: State,
        table: &PreconditionTable,
        states: &FxHashMap<StepId, State>,
    ) -> Vec<Action> {
        RuleTable::actions_from_state(state)
            .iter()
            .copied()
            .filter(|action| match table.preconditions_for(step, *action) {
                Some(list) => is_precondition_satisfied(list, states),
                None => true,
            })
            .collect()
    }
}
