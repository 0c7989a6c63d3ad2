//! Shared plumbing for unary gRPC calls
//!
//! Channels are created lazily and cached per address, so a reconcile that
//! talks to the same algorithm endpoint repeatedly reuses one HTTP/2
//! connection.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

/// Connect timeout for new channels
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-request deadline
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Lazily-connected channels keyed by address
#[derive(Clone, Default)]
pub struct ChannelCache {
    channels: Arc<DashMap<String, Channel>>,
}

impl ChannelCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel for `address` (`host:port` or a full URI)
    ///
    /// Must be called from within a Tokio runtime.
    pub fn channel(&self, address: &str) -> Result<Channel, tonic::transport::Error> {
        if let Some(channel) = self.channels.get(address) {
            return Ok(channel.clone());
        }

        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let channel = Endpoint::from_shared(uri)?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .connect_lazy();

        self.channels.insert(address.to_string(), channel.clone());
        Ok(channel)
    }

    /// Forget the channel for `address` so the next call reconnects
    pub fn evict(&self, address: &str) {
        self.channels.remove(address);
    }

    /// Cached channel for `address`, without creating one
    pub fn get_cached(&self, address: &str) -> Option<Channel> {
        self.channels.get(address).map(|c| c.clone())
    }

    /// Number of cached channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true when no channel is cached
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Issue one unary call on `channel`
pub async fn unary<Req, Resp>(
    channel: Channel,
    path: &'static str,
    request: Req,
) -> Result<Resp, tonic::Status>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| tonic::Status::unavailable(format!("service not ready: {e}")))?;

    let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
    let response = grpc
        .unary(
            tonic::Request::new(request),
            PathAndQuery::from_static(path),
            codec,
        )
        .await?;
    Ok(response.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channels_are_cached_per_address() {
        let cache = ChannelCache::new();
        cache.channel("mnist-random.research:6789").unwrap();
        cache.channel("mnist-random.research:6789").unwrap();
        cache.channel("http://db-manager.hypertune:6789").unwrap();
        assert_eq!(cache.len(), 2);

        cache.evict("mnist-random.research:6789");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let cache = ChannelCache::new();
        assert!(cache.channel("not a uri").is_err());
        assert!(cache.is_empty());
    }
}
