//! Client for search algorithm endpoints
//!
//! Every Suggestion runs its own algorithm Deployment. The Suggestion
//! controller reaches it through [`AlgorithmClient`] at
//! `{suggestion}-{algorithm}.{namespace}:6789`.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::grpc::{self, ChannelCache};
use crate::proto::{
    GetSuggestionsReply, GetSuggestionsRequest, ValidateAlgorithmSettingsReply,
    ValidateAlgorithmSettingsRequest, GET_SUGGESTIONS_PATH, VALIDATE_ALGORITHM_SETTINGS_PATH,
};
use crate::{Error, Result};

/// Calls into a search algorithm service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlgorithmClient: Send + Sync {
    /// Ask the algorithm for new assignments
    async fn get_suggestions(
        &self,
        endpoint: &str,
        request: GetSuggestionsRequest,
    ) -> Result<GetSuggestionsReply>;

    /// Ask the algorithm whether it accepts the experiment's settings
    ///
    /// Returns [`Error::AlgorithmRejected`] when it does not.
    async fn validate_algorithm_settings(
        &self,
        endpoint: &str,
        request: ValidateAlgorithmSettingsRequest,
    ) -> Result<()>;

    /// Drop any connection held for `endpoint` once it has been torn down
    fn release(&self, endpoint: &str);
}

/// [`AlgorithmClient`] over gRPC
#[derive(Clone, Default)]
pub struct GrpcAlgorithmClient {
    channels: ChannelCache,
}

impl GrpcAlgorithmClient {
    /// Create a client with an empty channel cache
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, endpoint: &str) -> Result<tonic::transport::Channel> {
        self.channels
            .channel(endpoint)
            .map_err(|e| Error::algorithm(format!("invalid endpoint {endpoint}: {e}")))
    }

    fn call_failed(&self, endpoint: &str, status: tonic::Status) -> Error {
        if matches!(
            status.code(),
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded
        ) {
            self.channels.evict(endpoint);
        }
        Error::algorithm(format!("{endpoint}: {}", status.message()))
    }
}

/// Map a validation failure, treating InvalidArgument as a rejection
pub fn validation_error(endpoint: &str, status: &tonic::Status) -> Error {
    match status.code() {
        tonic::Code::InvalidArgument => Error::algorithm_rejected(status.message()),
        _ => Error::algorithm(format!("{endpoint}: {}", status.message())),
    }
}

#[async_trait]
impl AlgorithmClient for GrpcAlgorithmClient {
    async fn get_suggestions(
        &self,
        endpoint: &str,
        request: GetSuggestionsRequest,
    ) -> Result<GetSuggestionsReply> {
        debug!(
            endpoint,
            current = request.current_request_number,
            total = request.total_request_number,
            "requesting suggestions"
        );
        let channel = self.channel(endpoint)?;
        grpc::unary(channel, GET_SUGGESTIONS_PATH, request)
            .await
            .map_err(|status| self.call_failed(endpoint, status))
    }

    async fn validate_algorithm_settings(
        &self,
        endpoint: &str,
        request: ValidateAlgorithmSettingsRequest,
    ) -> Result<()> {
        let channel = self.channel(endpoint)?;
        grpc::unary::<_, ValidateAlgorithmSettingsReply>(
            channel,
            VALIDATE_ALGORITHM_SETTINGS_PATH,
            request,
        )
        .await
        .map(|_| ())
        .map_err(|status| {
            if status.code() == tonic::Code::Unavailable {
                self.channels.evict(endpoint);
            }
            validation_error(endpoint, &status)
        })
    }

    fn release(&self, endpoint: &str) {
        self.channels.evict(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_is_terminal_rejection() {
        let status = tonic::Status::invalid_argument("unknown setting 'foo'");
        let err = validation_error("mnist-random.research:6789", &status);
        assert!(matches!(err, Error::AlgorithmRejected(_)));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_unavailable_is_retryable() {
        let status = tonic::Status::unavailable("connection refused");
        let err = validation_error("mnist-random.research:6789", &status);
        assert!(matches!(err, Error::Algorithm(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_evicts_channel() {
        let client = GrpcAlgorithmClient::new();
        client.channel("mnist-random.research:6789").unwrap();
        assert_eq!(client.channels.len(), 1);

        let err = client.call_failed(
            "mnist-random.research:6789",
            tonic::Status::unavailable("connection refused"),
        );
        assert!(err.to_string().contains("connection refused"));
        assert!(client.channels.is_empty());
    }

    #[tokio::test]
    async fn test_released_endpoint_leaves_the_cache() {
        let client = GrpcAlgorithmClient::new();
        client.channel("mnist-random.research:6789").unwrap();
        client.channel("cifar-tpe.research:6789").unwrap();

        client.release("mnist-random.research:6789");

        assert_eq!(client.channels.len(), 1);
        assert!(client.channels.get_cached("mnist-random.research:6789").is_none());
    }
}
