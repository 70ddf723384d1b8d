use crate::{
    chain::{ChainClient, RpcChainClient},
    config::AgentConfig,
    error::{NegotiationError, Result},
    model::{Demand, Offer, SettlementMessage},
    offer::OfferBuilder,
    pubsub::{IpfsPubSub, PubSub, PubSubMessage},
    signer::OfferSigner,
    tracker::{Correlation, CorrelationTracker},
};
use alloy_primitives::Address;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Activated(Address),
    Correlated(Correlation),
}

/// One provider identity: its key, its collaborators and its negotiations.
///
/// Handlers take `&self` and may run concurrently across channels; the
/// tracker is the only mutable state and sits behind a mutex.
pub struct ProviderAgent {
    config: AgentConfig,
    builder: OfferBuilder,
    chain: Arc<dyn ChainClient>,
    pubsub: Arc<dyn PubSub>,
    tracker: Mutex<CorrelationTracker>,
}

impl ProviderAgent {
    pub fn new(
        config: AgentConfig,
        chain: Arc<dyn ChainClient>,
        pubsub: Arc<dyn PubSub>,
    ) -> Result<Self> {
        config.validate()?;

        let signer = Arc::new(OfferSigner::from_hex(config.spot_pk.expose())?);
        let configured = config.agent_address()?;
        if signer.address() != configured {
            return Err(NegotiationError::Config(format!(
                "spot_address {} does not match the address of spot_pk",
                configured
            )));
        }

        let builder = OfferBuilder::new(signer, config.field_order()?, config.deadline_horizon);

        Ok(Self {
            config,
            builder,
            chain,
            pubsub,
            tracker: Mutex::new(CorrelationTracker::new()),
        })
    }

    /// Wires the agent to a JSON-RPC node and a Kubo pubsub API.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let chain = Arc::new(RpcChainClient::new(&config.http_node_provider)?);
        let pubsub = Arc::new(IpfsPubSub::new(config.ipfs_api_url.clone()));
        Self::new(config, chain, pubsub)
    }

    pub fn address(&self) -> Address {
        self.builder.agent_address()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn builder(&self) -> &OfferBuilder {
        &self.builder
    }

    pub fn tracker(&self) -> MutexGuard<'_, CorrelationTracker> {
        self.tracker.lock()
    }

    /// Turns a trusted demand into a published, tracked offer.
    pub async fn handle_demand(&self, message: &PubSubMessage) -> Result<Arc<Offer>> {
        if message.sender_id != self.config.ipfs_id_dapp {
            return Err(NegotiationError::UntrustedSender(message.sender_id.clone()));
        }

        let demand = Demand::from_json(&message.data)?;
        let offer = Arc::new(self.builder.build_fresh(demand, self.chain.as_ref()).await?);

        let payload = offer.to_json()?;

        // Tracked before publishing so a fast liability notice finds it
        let (digest, fresh) = {
            let mut tracker = self.tracker.lock();
            let fresh = !tracker.contains(&offer.digest());
            (tracker.track(Arc::clone(&offer)), fresh)
        };

        if let Err(e) = self
            .pubsub
            .publish(&self.config.provider_ipfs_topic, payload)
            .await
        {
            if fresh {
                self.tracker.lock().discard(&digest);
            }
            return Err(e);
        }

        tracing::info!(
            offer = %digest,
            nonce = offer.nonce(),
            deadline = offer.deadline(),
            topic = %self.config.provider_ipfs_topic,
            "Offer published"
        );

        Ok(offer)
    }

    pub async fn handle_settlement(&self, message: &PubSubMessage) -> Result<SettlementOutcome> {
        if message.sender_id != self.config.ipfs_id_spot {
            return Err(NegotiationError::UntrustedSender(message.sender_id.clone()));
        }

        match SettlementMessage::from_json(&message.data)? {
            SettlementMessage::Liability(notice) => {
                self.tracker.lock().activate(notice.offer, notice.liability)?;
                Ok(SettlementOutcome::Activated(notice.liability))
            }
            SettlementMessage::Result(report) => {
                let correlation = self
                    .tracker
                    .lock()
                    .record_result(report.liability, &report.result);

                if correlation == Correlation::Completed {
                    tracing::info!(
                        liability = %report.liability,
                        result = %report.result,
                        "Negotiation completed"
                    );
                }
                Ok(SettlementOutcome::Correlated(correlation))
            }
        }
    }

    /// Expires negotiations past their deadline and prunes old terminal ones.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let height = self.chain.block_number().await?;

        let mut tracker = self.tracker.lock();
        let expired = tracker.expire(height);
        let pruned = tracker.prune(height, self.config.retention_blocks);
        if pruned > 0 {
            tracing::debug!(height, pruned, "Pruned negotiations");
        }

        Ok(expired)
    }

    async fn on_demand(&self, message: PubSubMessage) {
        if let Err(e) = self.handle_demand(&message).await {
            log_dropped("demand", &message, &e);
        }
    }

    async fn on_settlement(&self, message: PubSubMessage) {
        if let Err(e) = self.handle_settlement(&message).await {
            log_dropped("settlement", &message, &e);
        }
    }

    /// Subscribes to both channels and processes them until a subscription
    /// closes. Each channel is handled sequentially on its own task.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut demands = self
            .pubsub
            .subscribe(&self.config.provider_ipfs_topic)
            .await?;
        tracing::info!(topic = %self.config.provider_ipfs_topic, "Subscribed");

        let mut settlements = self.pubsub.subscribe(&self.config.spot_ipfs_topic).await?;
        tracing::info!(topic = %self.config.spot_ipfs_topic, "Subscribed");

        let agent = Arc::clone(&self);
        let mut demand_task = tokio::spawn(async move {
            while let Some(message) = demands.recv().await {
                agent.on_demand(message).await;
            }
        });

        let agent = Arc::clone(&self);
        let mut settlement_task = tokio::spawn(async move {
            while let Some(message) = settlements.recv().await {
                agent.on_settlement(message).await;
            }
        });

        let agent = Arc::clone(&self);
        let period = Duration::from_secs(self.config.expiry_check_interval_secs);
        let mut sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = agent.sweep_expired().await {
                    tracing::warn!(error = %e, "Expiry sweep failed");
                }
            }
        });

        tokio::select! {
            _ = &mut demand_task => tracing::warn!("Demand subscription closed"),
            _ = &mut settlement_task => tracing::warn!("Settlement subscription closed"),
            _ = &mut sweep_task => tracing::warn!("Expiry sweep stopped"),
        }

        demand_task.abort();
        settlement_task.abort();
        sweep_task.abort();
        Ok(())
    }
}

fn log_dropped(channel: &str, message: &PubSubMessage, error: &NegotiationError) {
    if error.is_benign() {
        tracing::debug!(channel, sender = %message.sender_id, "Ignoring message from untrusted sender");
    } else {
        tracing::warn!(channel, sender = %message.sender_id, error = %error, "Dropping message");
    }
}
