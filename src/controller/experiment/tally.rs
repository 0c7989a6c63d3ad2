//! Trial classification, best-trial tracking and completion rules

use std::cmp::Ordering;

use kube::ResourceExt;

use crate::crd::{
    experiment_reasons as reasons, ExperimentPhase, ExperimentSpec, ExperimentStatus,
    ObjectiveSpec, OptimalTrial, Trial, TrialPhase,
};

/// Order trials by creation timestamp, then name
pub fn creation_order(a: &Trial, b: &Trial) -> Ordering {
    a.creation_timestamp()
        .cmp(&b.creation_timestamp())
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

/// Trials grouped by phase, plus the best observed trial
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrialTally {
    /// Created, not yet running
    pub pending: Vec<String>,
    /// Running, or succeeded while still waiting for the objective metric
    pub running: Vec<String>,
    /// Succeeded with an objective observation
    pub succeeded: Vec<String>,
    /// Failed
    pub failed: Vec<String>,
    /// Killed, not yet deleted
    pub killed: Vec<String>,
    /// Best trial and its objective value
    pub best: Option<(f64, OptimalTrial)>,
}

impl TrialTally {
    /// Classify `trials` (in creation order) against `objective`
    pub fn from_trials(trials: &[Trial], objective: &ObjectiveSpec) -> Self {
        let mut tally = Self::default();

        for trial in trials {
            let name = trial.name_any();
            let value = trial.objective_value();
            match trial.phase() {
                TrialPhase::Created => tally.pending.push(name.clone()),
                TrialPhase::Running => tally.running.push(name.clone()),
                TrialPhase::Succeeded if value.is_some() => tally.succeeded.push(name.clone()),
                TrialPhase::Succeeded => tally.running.push(name.clone()),
                TrialPhase::Failed => tally.failed.push(name.clone()),
                TrialPhase::Killed => tally.killed.push(name.clone()),
            }

            let Some(value) = value else { continue };
            let improves = match &tally.best {
                None => true,
                Some((best, _)) => objective.type_.improves(value, *best),
            };
            if improves {
                let observation = trial
                    .status
                    .as_ref()
                    .and_then(|s| s.observation.clone())
                    .unwrap_or_default();
                tally.best = Some((
                    value,
                    OptimalTrial {
                        best_trial_name: name,
                        parameter_assignments: trial.spec.parameter_assignments.clone(),
                        observation,
                    },
                ));
            }
        }

        tally
    }

    /// Pending plus running
    pub fn active(&self) -> u32 {
        (self.pending.len() + self.running.len()) as u32
    }

    /// Succeeded plus failed plus killed
    pub fn completed(&self) -> u32 {
        (self.succeeded.len() + self.failed.len() + self.killed.len()) as u32
    }

    /// Every classified trial
    pub fn listed(&self) -> u32 {
        self.active() + self.completed()
    }

    /// Returns true if the name belongs to a listed trial
    pub fn contains(&self, name: &str) -> bool {
        [
            &self.pending,
            &self.running,
            &self.succeeded,
            &self.failed,
            &self.killed,
        ]
        .iter()
        .any(|list| list.iter().any(|n| n == name))
    }

    /// Record that an active trial was marked Killed
    pub fn mark_killed(&mut self, name: &str) {
        self.pending.retain(|n| n != name);
        self.running.retain(|n| n != name);
        self.killed.push(name.to_string());
    }

    /// Record a newly created trial
    pub fn mark_created(&mut self, name: &str) {
        self.pending.push(name.to_string());
    }

    /// Best objective value reached the goal
    pub fn goal_reached(&self, objective: &ObjectiveSpec) -> bool {
        match (&self.best, objective.goal) {
            (Some((value, _)), Some(goal)) => objective.type_.reached(*value, goal),
            _ => false,
        }
    }

    /// Copy counts, lists and the best trial into `status`
    pub fn apply(&self, status: &mut ExperimentStatus) {
        status.trials = self.listed();
        status.trials_pending = self.pending.len() as u32;
        status.trials_running = self.running.len() as u32;
        status.trials_succeeded = self.succeeded.len() as u32;
        status.trials_failed = self.failed.len() as u32;
        status.trials_killed = self.killed.len() as u32;
        status.pending_trial_list = self.pending.clone();
        status.running_trial_list = self.running.clone();
        status.succeeded_trial_list = self.succeeded.clone();
        status.failed_trial_list = self.failed.clone();
        status.killed_trial_list = self.killed.clone();
        if let Some((_, best)) = &self.best {
            status.current_optimal_trial = Some(best.clone());
        }
    }
}

/// Terminal outcome for an experiment
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    /// Succeeded or Failed
    pub phase: ExperimentPhase,
    /// Condition reason
    pub reason: &'static str,
    /// Human-readable message
    pub message: String,
}

/// Decide whether the experiment is done, in priority order
pub fn completion(
    spec: &ExperimentSpec,
    tally: &TrialTally,
    suggestion_exhausted: bool,
) -> Option<Completion> {
    if tally.goal_reached(&spec.objective) {
        let best = tally
            .best
            .as_ref()
            .map(|(_, b)| b.best_trial_name.as_str())
            .unwrap_or_default();
        return Some(Completion {
            phase: ExperimentPhase::Succeeded,
            reason: reasons::GOAL_REACHED,
            message: format!("Objective goal reached by trial {best}"),
        });
    }

    if let Some(max) = spec.max_trial_count {
        if tally.completed() >= max {
            return Some(Completion {
                phase: ExperimentPhase::Succeeded,
                reason: reasons::MAX_TRIALS_REACHED,
                message: format!("{max} trials completed"),
            });
        }
    }

    if suggestion_exhausted && tally.active() == 0 {
        return Some(Completion {
            phase: ExperimentPhase::Succeeded,
            reason: reasons::SUGGESTION_EXHAUSTED,
            message: "Search space exhausted and no trials remain active".to_string(),
        });
    }

    if let Some(max_failed) = spec.max_failed_trial_count {
        if tally.failed.len() as u32 >= max_failed {
            return Some(Completion {
                phase: ExperimentPhase::Failed,
                reason: reasons::MAX_FAILED_TRIALS_REACHED,
                message: format!("{} trials failed", tally.failed.len()),
            });
        }
    }

    None
}

/// A completed experiment may resume when its budget was raised
pub fn is_restartable(spec: &ExperimentSpec, status: &ExperimentStatus) -> bool {
    status.phase == ExperimentPhase::Succeeded
        && status.phase_reason() == Some(reasons::MAX_TRIALS_REACHED)
        && spec.resume_policy == crate::crd::ResumePolicy::LongRunning
        && spec
            .max_trial_count
            .is_some_and(|max| max > status.completed_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::experiment::fixtures::{sample_spec, trial};
    use crate::crd::{ObjectiveType, ResumePolicy};

    #[test]
    fn story_best_trial_follows_objective_direction() {
        let mut spec = sample_spec();
        spec.objective.type_ = ObjectiveType::Maximize;
        let trials = vec![
            trial("exp-a", 1, TrialPhase::Succeeded, Some(0.7)),
            trial("exp-b", 2, TrialPhase::Succeeded, Some(0.9)),
        ];
        let tally = TrialTally::from_trials(&trials, &spec.objective);
        let (value, best) = tally.best.unwrap();
        assert_eq!(value, 0.9);
        assert_eq!(best.best_trial_name, "exp-b");
    }

    #[test]
    fn story_ties_keep_the_earlier_trial() {
        let spec = sample_spec();
        let trials = vec![
            trial("exp-a", 1, TrialPhase::Succeeded, Some(0.5)),
            trial("exp-b", 2, TrialPhase::Succeeded, Some(0.5)),
        ];
        let tally = TrialTally::from_trials(&trials, &spec.objective);
        assert_eq!(tally.best.unwrap().1.best_trial_name, "exp-a");
    }

    #[test]
    fn story_succeeded_without_metric_counts_as_running() {
        let spec = sample_spec();
        let trials = vec![
            trial("exp-a", 1, TrialPhase::Succeeded, None),
            trial("exp-b", 2, TrialPhase::Created, None),
        ];
        let tally = TrialTally::from_trials(&trials, &spec.objective);
        assert_eq!(tally.running, vec!["exp-a"]);
        assert_eq!(tally.pending, vec!["exp-b"]);
        assert_eq!(tally.active(), 2);
        assert_eq!(tally.completed(), 0);
        assert!(tally.best.is_none());
    }

    #[test]
    fn story_counts_never_exceed_listed_trials() {
        let spec = sample_spec();
        let trials = vec![
            trial("exp-a", 1, TrialPhase::Succeeded, Some(0.4)),
            trial("exp-b", 2, TrialPhase::Running, None),
        ];
        let tally = TrialTally::from_trials(&trials, &spec.objective);

        let mut status = ExperimentStatus::default();
        status.killed_trial_list = vec!["exp-c".to_string()];
        status.trials_killed = 1;
        tally.apply(&mut status);

        let sum = status.trials_pending
            + status.trials_running
            + status.trials_succeeded
            + status.trials_failed
            + status.trials_killed;
        assert_eq!(sum, 2);
        assert_eq!(status.trials, 2);
        assert!(status.killed_trial_list.is_empty());
        assert!(!tally.contains("exp-c"));
    }

    #[test]
    fn story_goal_outranks_max_trials() {
        let mut spec = sample_spec();
        spec.objective.type_ = ObjectiveType::Maximize;
        spec.objective.goal = Some(0.85);
        spec.max_trial_count = Some(2);
        let trials = vec![
            trial("exp-a", 1, TrialPhase::Succeeded, Some(0.7)),
            trial("exp-b", 2, TrialPhase::Succeeded, Some(0.9)),
        ];
        let tally = TrialTally::from_trials(&trials, &spec.objective);
        let done = completion(&spec, &tally, false).unwrap();
        assert_eq!(done.reason, reasons::GOAL_REACHED);
        assert_eq!(done.phase, ExperimentPhase::Succeeded);
    }

    #[test]
    fn story_minimize_goal_is_inclusive() {
        let mut spec = sample_spec();
        spec.objective.goal = Some(0.1);
        let trials = vec![trial("exp-a", 1, TrialPhase::Succeeded, Some(0.1))];
        let tally = TrialTally::from_trials(&trials, &spec.objective);
        assert_eq!(
            completion(&spec, &tally, false).unwrap().reason,
            reasons::GOAL_REACHED
        );
    }

    #[test]
    fn story_exhaustion_waits_for_active_trials() {
        let spec = sample_spec();
        let running = vec![trial("exp-a", 1, TrialPhase::Running, None)];
        let tally = TrialTally::from_trials(&running, &spec.objective);
        assert!(completion(&spec, &tally, true).is_none());

        let done = vec![trial("exp-a", 1, TrialPhase::Failed, None)];
        let tally = TrialTally::from_trials(&done, &spec.objective);
        assert_eq!(
            completion(&spec, &tally, true).unwrap().reason,
            reasons::SUGGESTION_EXHAUSTED
        );
    }

    #[test]
    fn story_too_many_failures_fail_the_experiment() {
        let mut spec = sample_spec();
        spec.max_failed_trial_count = Some(2);
        let trials = vec![
            trial("exp-a", 1, TrialPhase::Failed, None),
            trial("exp-b", 2, TrialPhase::Failed, None),
            trial("exp-c", 3, TrialPhase::Running, None),
        ];
        let tally = TrialTally::from_trials(&trials, &spec.objective);
        let done = completion(&spec, &tally, false).unwrap();
        assert_eq!(done.phase, ExperimentPhase::Failed);
        assert_eq!(done.reason, reasons::MAX_FAILED_TRIALS_REACHED);
    }

    #[test]
    fn story_max_trials_outranks_failures() {
        let mut spec = sample_spec();
        spec.max_trial_count = Some(2);
        spec.max_failed_trial_count = Some(1);
        let trials = vec![
            trial("exp-a", 1, TrialPhase::Failed, None),
            trial("exp-b", 2, TrialPhase::Failed, None),
        ];
        let tally = TrialTally::from_trials(&trials, &spec.objective);
        assert_eq!(
            completion(&spec, &tally, false).unwrap().reason,
            reasons::MAX_TRIALS_REACHED
        );
    }

    #[test]
    fn story_raised_budget_makes_long_running_experiment_restartable() {
        let mut spec = sample_spec();
        spec.max_trial_count = Some(4);
        let mut status = ExperimentStatus::default();
        status.trials_succeeded = 3;
        status.transition(
            ExperimentPhase::Succeeded,
            reasons::MAX_TRIALS_REACHED,
            "3 trials completed",
        );

        assert!(!is_restartable(&spec, &status));
        spec.resume_policy = ResumePolicy::LongRunning;
        assert!(is_restartable(&spec, &status));
        spec.max_trial_count = Some(3);
        assert!(!is_restartable(&spec, &status));
    }
}
