//! Trial admission arithmetic

use kube::ResourceExt;

use crate::crd::{Trial, TrialAssignment, TrialPhase};

use super::tally::{creation_order, TrialTally};

/// What admission should do this pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Too many active trials; kill this many
    Kill(u32),
    /// Room for this many new trials
    Add(u32),
}

/// Compare active trials against parallelism and the remaining budget
pub fn plan(parallel: u32, max_trial_count: Option<u32>, active: u32, completed: u32) -> Admission {
    if active > parallel {
        return Admission::Kill(active - parallel);
    }
    let target = match max_trial_count {
        Some(max) => parallel.min(max.saturating_sub(completed)),
        None => parallel,
    };
    Admission::Add(target.saturating_sub(active))
}

/// Active trials to kill, newest first
pub fn victims(trials: &[Trial], count: u32) -> Vec<&Trial> {
    let mut active: Vec<&Trial> = trials.iter().filter(|t| !t.is_completed()).collect();
    active.sort_by(|a, b| creation_order(b, a));
    active.into_iter().take(count as usize).collect()
}

/// Length of the consumed prefix of `suggestions`
///
/// The larger of the recorded cursor and one past the last assignment that
/// already belongs to a listed trial.
pub fn consumed(suggestions: &[TrialAssignment], tally: &TrialTally, recorded: u32) -> u32 {
    let listed = suggestions
        .iter()
        .rposition(|a| tally.contains(&a.name))
        .map_or(0, |i| i as u32 + 1);
    recorded.max(listed)
}

/// Assignments to turn into trials, with their positions
///
/// Positions `[consumed..]` are unconsumed; names that already belong to a
/// trial are skipped. At most `add` are returned.
pub fn new_assignments<'a>(
    suggestions: &'a [TrialAssignment],
    consumed: u32,
    tally: &TrialTally,
    add: u32,
) -> Vec<(u32, &'a TrialAssignment)> {
    suggestions
        .iter()
        .enumerate()
        .skip(consumed as usize)
        .filter(|(_, a)| !tally.contains(&a.name))
        .take(add as usize)
        .map(|(i, a)| (i as u32, a))
        .collect()
}

/// Unconsumed assignments, used to cap admission once the search is exhausted
pub fn unconsumed(suggestions: &[TrialAssignment], consumed: u32, tally: &TrialTally) -> u32 {
    suggestions
        .iter()
        .skip(consumed as usize)
        .filter(|a| !tally.contains(&a.name))
        .count() as u32
}

/// Killed trials whose position lies inside the recorded consumed prefix
///
/// Only these may be deleted: the record of their position outlives them.
pub fn retired<'a>(
    trials: &'a [Trial],
    suggestions: &[TrialAssignment],
    recorded: u32,
) -> Vec<&'a Trial> {
    trials
        .iter()
        .filter(|t| t.phase() == TrialPhase::Killed)
        .filter(|t| {
            let name = t.name_any();
            suggestions
                .iter()
                .position(|a| a.name == name)
                .is_some_and(|i| (i as u32) < recorded)
        })
        .collect()
}

/// Names of `trials`, for logging
pub fn names(trials: &[&Trial]) -> Vec<String> {
    trials.iter().map(|t| t.name_any()).collect()
}
