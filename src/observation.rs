//! Observation store client
//!
//! Training code reports metric samples to the shared observation store.
//! The Trial controller reads them back once the job succeeds and reduces
//! each log to min, max and latest.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::crd::Metric;
use crate::grpc::{self, ChannelCache};
use crate::proto::{GetObservationLogReply, GetObservationLogRequest, GET_OBSERVATION_LOG_PATH};
use crate::{Error, Result};

/// One reported metric sample
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    /// When the sample was reported
    pub timestamp: String,
    /// Raw reported value
    pub value: String,
}

/// Reads metric logs for trials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Samples of `metric` reported by `trial` between `start` and `end`, in report order
    async fn metric_log(
        &self,
        trial: &str,
        metric: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricSample>>;
}

/// Reduce a log to min, max and latest
///
/// Unparsable and non-finite samples are skipped. Returns `None` when no
/// usable sample remains.
pub fn reduce(name: &str, samples: &[MetricSample]) -> Option<Metric> {
    let mut values = samples
        .iter()
        .filter_map(|s| s.value.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite());

    let first = values.next()?;
    let mut metric = Metric {
        name: name.to_string(),
        min: first,
        max: first,
        latest: first,
    };
    for value in values {
        metric.min = metric.min.min(value);
        metric.max = metric.max.max(value);
        metric.latest = value;
    }
    Some(metric)
}

/// [`ObservationStore`] backed by the `DBManager` gRPC service
#[derive(Clone)]
pub struct GrpcObservationStore {
    address: String,
    channels: ChannelCache,
}

impl GrpcObservationStore {
    /// Create a client for the store at `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            channels: ChannelCache::new(),
        }
    }
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[async_trait]
impl ObservationStore for GrpcObservationStore {
    async fn metric_log(
        &self,
        trial: &str,
        metric: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricSample>> {
        let channel = self
            .channels
            .channel(&self.address)
            .map_err(|e| {
                Error::observation_store(format!("invalid address {}: {e}", self.address))
            })?;

        let request = GetObservationLogRequest {
            trial_name: trial.to_string(),
            metric_name: metric.to_string(),
            start_time: format_time(start),
            end_time: format_time(end),
        };

        let reply: GetObservationLogReply = grpc::unary(channel, GET_OBSERVATION_LOG_PATH, request)
            .await
            .map_err(|status| {
                if status.code() == tonic::Code::Unavailable {
                    self.channels.evict(&self.address);
                }
                Error::observation_store(format!("{trial}/{metric}: {}", status.message()))
            })?;

        let samples: Vec<MetricSample> = reply
            .metric_logs
            .into_iter()
            .filter_map(|log| {
                let m = log.metric?;
                (m.name == metric).then_some(MetricSample {
                    timestamp: log.time_stamp,
                    value: m.value,
                })
            })
            .collect();

        debug!(trial, metric, samples = samples.len(), "read observation log");
        Ok(samples)
    }
}
