use crate::{NegotiationError, Result};
use alloy_primitives::Address;
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;

/// The two chain reads the agent depends on. Neither value may be cached
/// across offer builds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    async fn transaction_count(&self, address: Address) -> Result<u64>;
}

/// JSON-RPC chain client over HTTP.
pub struct RpcChainClient {
    provider: DynProvider,
}

impl RpcChainClient {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let url = rpc_url
            .parse::<reqwest::Url>()
            .map_err(|e| NegotiationError::Config(format!("Invalid node URL {}: {}", rpc_url, e)))?;

        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self { provider })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn block_number(&self) -> Result<u64> {
        self.provider.get_block_number().await.map_err(|e| {
            NegotiationError::UpstreamUnavailable(format!("Failed to fetch block number: {}", e))
        })
    }

    async fn transaction_count(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .await
            .map_err(|e| {
                NegotiationError::UpstreamUnavailable(format!(
                    "Failed to fetch transaction count for {}: {}",
                    address, e
                ))
            })
    }
}
