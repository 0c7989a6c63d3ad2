//! Fill the assignment list up to the requested count

use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::algorithm::AlgorithmClient;
use crate::crd::{AlgorithmSetting, Experiment, SuggestionStatus, Trial, TrialAssignment};
use crate::proto::{ExperimentMessage, GetSuggestionsRequest, TrialMessage};
use crate::Error;

const NAME_SUFFIX_LEN: usize = 8;

/// Trial name for an assignment the algorithm left unnamed
pub fn generated_name(experiment: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{experiment}-{suffix}")
}

/// Experiment message with settings reported by the algorithm merged in
fn experiment_message(experiment: &Experiment, status: &SuggestionStatus) -> ExperimentMessage {
    let mut message = ExperimentMessage::from(experiment);
    if let Some(algorithm) = message.spec.as_mut().and_then(|s| s.algorithm.as_mut()) {
        for reported in &status.algorithm_settings {
            match algorithm
                .algorithm_settings
                .iter_mut()
                .find(|s| s.name == reported.name)
            {
                Some(existing) => existing.value = reported.value.clone(),
                None => algorithm.algorithm_settings.push(reported.into()),
            }
        }
    }
    message
}

/// Call the algorithm until `requests` assignments exist or the search ends
///
/// Mutates `status` in place; the caller discards it on error. Returns the
/// number of assignments appended.
pub async fn sync_assignments(
    algorithm: &dyn AlgorithmClient,
    endpoint: &str,
    requests: u32,
    experiment: &Experiment,
    trials: &[Trial],
    status: &mut SuggestionStatus,
) -> Result<u32, Error> {
    let (completed, running): (Vec<&Trial>, Vec<&Trial>) =
        trials.iter().partition(|t| t.is_completed());
    let completed: Vec<TrialMessage> = completed.into_iter().map(Into::into).collect();
    let running: Vec<TrialMessage> = running.into_iter().map(Into::into).collect();
    let experiment_name = experiment.name_any();
    let mut appended = 0;

    while (status.suggestions.len() as u32) < requests && !status.search_exhausted {
        let deficit = requests - status.suggestions.len() as u32;
        let request = GetSuggestionsRequest {
            experiment: Some(experiment_message(experiment, status)),
            completed_trials: completed.clone(),
            running_trials: running.clone(),
            current_request_number: deficit,
            total_request_number: requests,
        };
        let reply = algorithm.get_suggestions(endpoint, request).await?;
        debug!(
            returned = reply.trials.len(),
            deficit,
            search_end = reply.search_end,
            "algorithm replied"
        );

        if reply.trials.is_empty() && !reply.search_end {
            return Err(Error::algorithm(format!(
                "{endpoint} returned no assignments for {deficit} requested"
            )));
        }

        if let Some(spec) = reply.algorithm {
            status.merge_algorithm_settings(
                spec.algorithm_settings
                    .into_iter()
                    .map(AlgorithmSetting::from)
                    .collect(),
            );
        }

        let batch: Vec<TrialAssignment> = reply
            .trials
            .into_iter()
            .take(deficit as usize)
            .map(|t| {
                let mut assignment = TrialAssignment::from(t);
                if assignment.name.is_empty() {
                    assignment.name = generated_name(&experiment_name);
                }
                assignment
            })
            .collect();
        appended += batch.len() as u32;
        status.append(batch);

        if reply.search_end {
            status.search_exhausted = true;
        }
    }

    Ok(appended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::MockAlgorithmClient;
    use crate::controller::experiment::fixtures::{experiment, sample_spec, trial};
    use crate::crd::TrialPhase;
    use crate::proto::{self, GetSuggestionsReply};
    use std::sync::{Arc, Mutex};

    fn proto_assignment(name: &str) -> proto::TrialAssignment {
        proto::TrialAssignment {
            name: name.to_string(),
            assignments: vec![proto::ParameterAssignment {
                name: "lr".to_string(),
                value: "0.05".to_string(),
            }],
        }
    }

    #[test]
    fn test_generated_names_are_lowercase_and_prefixed() {
        let name = generated_name("mnist");
        let suffix = name.strip_prefix("mnist-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn story_reply_is_truncated_to_the_deficit() {
        let requests_seen = Arc::new(Mutex::new(Vec::new()));
        let seen = requests_seen.clone();
        let mut client = MockAlgorithmClient::new();
        client.expect_get_suggestions().returning(move |_, req| {
            seen.lock().unwrap().push((
                req.current_request_number,
                req.total_request_number,
                req.completed_trials.len(),
                req.running_trials.len(),
            ));
            Ok(GetSuggestionsReply {
                trials: vec![
                    proto_assignment("exp-c"),
                    proto_assignment(""),
                    proto_assignment("exp-e"),
                ],
                algorithm: None,
                search_end: false,
            })
        });

        let exp = experiment(sample_spec());
        let trials = vec![
            trial("exp-a", 1, TrialPhase::Succeeded, Some(0.3)),
            trial("exp-b", 2, TrialPhase::Running, None),
        ];
        let mut status = SuggestionStatus::default();
        status.append(vec![
            TrialAssignment::from(proto_assignment("exp-a")),
            TrialAssignment::from(proto_assignment("exp-b")),
        ]);

        let appended = sync_assignments(&client, "ep", 4, &exp, &trials, &mut status)
            .await
            .unwrap();

        assert_eq!(appended, 2);
        assert_eq!(status.suggestion_count, 4);
        assert_eq!(status.suggestions[2].name, "exp-c");
        assert!(status.suggestions[3].name.starts_with("exp-"));
        assert_eq!(*requests_seen.lock().unwrap(), vec![(2, 4, 1, 1)]);
    }

    #[tokio::test]
    async fn story_search_end_marks_exhaustion() {
        let mut client = MockAlgorithmClient::new();
        client.expect_get_suggestions().times(1).returning(|_, _| {
            Ok(GetSuggestionsReply {
                trials: vec![proto_assignment("exp-a")],
                algorithm: Some(proto::AlgorithmSpec {
                    algorithm_name: "grid".to_string(),
                    algorithm_settings: vec![proto::AlgorithmSetting {
                        name: "seed".to_string(),
                        value: "7".to_string(),
                    }],
                }),
                search_end: true,
            })
        });

        let mut status = SuggestionStatus::default();
        let exp = experiment(sample_spec());
        sync_assignments(&client, "ep", 3, &exp, &[], &mut status)
            .await
            .unwrap();

        assert!(status.search_exhausted);
        assert_eq!(status.suggestion_count, 1);
        assert_eq!(status.algorithm_settings[0].name, "seed");
    }

    #[tokio::test]
    async fn story_empty_reply_without_search_end_is_an_error() {
        let mut client = MockAlgorithmClient::new();
        client.expect_get_suggestions().returning(|_, _| {
            Ok(GetSuggestionsReply {
                trials: vec![],
                algorithm: None,
                search_end: false,
            })
        });

        let mut status = SuggestionStatus::default();
        let exp = experiment(sample_spec());
        let err = sync_assignments(&client, "ep", 1, &exp, &[], &mut status)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Algorithm(_)));
        assert!(status.suggestions.is_empty());
    }

    #[tokio::test]
    async fn story_satisfied_requests_make_no_calls() {
        let client = MockAlgorithmClient::new();
        let mut status = SuggestionStatus::default();
        status.append(vec![TrialAssignment::from(proto_assignment("exp-a"))]);
        let exp = experiment(sample_spec());

        let appended = sync_assignments(&client, "ep", 1, &exp, &[], &mut status)
            .await
            .unwrap();
        assert_eq!(appended, 0);
    }

    #[test]
    fn test_reported_settings_override_experiment_settings() {
        let mut spec = sample_spec();
        spec.algorithm.algorithm_settings = vec![AlgorithmSetting {
            name: "seed".to_string(),
            value: "1".to_string(),
        }];
        let exp = experiment(spec);
        let mut status = SuggestionStatus::default();
        status.merge_algorithm_settings(vec![AlgorithmSetting {
            name: "seed".to_string(),
            value: "7".to_string(),
        }]);

        let message = experiment_message(&exp, &status);
        let settings = message.spec.unwrap().algorithm.unwrap().algorithm_settings;
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].value, "7");
    }
}
