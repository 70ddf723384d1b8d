use crate::{
    chain::ChainClient,
    encoding::{offer_digest, FieldOrder},
    model::{Demand, Offer, OfferTerms, SignedOfferPayload},
    signer::OfferSigner,
    NegotiationError, Result,
};
use alloy_primitives::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_DEADLINE_HORIZON: u64 = 1000;

/// Turns validated demands into signed offers.
pub struct OfferBuilder {
    signer: Arc<OfferSigner>,
    field_order: FieldOrder,
    deadline_horizon: u64,
    // One past the highest nonce signed so far; zero means none yet.
    nonce_floor: AtomicU64,
}

impl OfferBuilder {
    pub fn new(signer: Arc<OfferSigner>, field_order: FieldOrder, deadline_horizon: u64) -> Self {
        Self {
            signer,
            field_order,
            deadline_horizon,
            nonce_floor: AtomicU64::new(0),
        }
    }

    pub fn agent_address(&self) -> Address {
        self.signer.address()
    }

    pub fn field_order(&self) -> &FieldOrder {
        &self.field_order
    }

    pub fn deadline_horizon(&self) -> u64 {
        self.deadline_horizon
    }

    pub fn build(
        &self,
        demand: Demand,
        chain_height: u64,
        account_nonce: u64,
        agent_address: Address,
    ) -> Result<Offer> {
        if agent_address != self.signer.address() {
            return Err(NegotiationError::Signing(format!(
                "Sender {} does not match signing key address {}",
                agent_address,
                self.signer.address()
            )));
        }

        let deadline = chain_height.checked_add(self.deadline_horizon).ok_or_else(|| {
            NegotiationError::Validation(format!(
                "Deadline overflows at height {} with horizon {}",
                chain_height, self.deadline_horizon
            ))
        })?;

        let terms = OfferTerms {
            demand,
            deadline,
            nonce: account_nonce,
            sender: agent_address,
        };

        let digest = offer_digest(&terms, &self.field_order);
        let signature = self.signer.sign(&digest)?;

        Ok(Offer::new(terms, digest, signature))
    }

    /// Fetches height and nonce for this build only, then builds.
    pub async fn build_fresh(&self, demand: Demand, chain: &dyn ChainClient) -> Result<Offer> {
        let agent_address = self.signer.address();
        let (chain_height, account_nonce) =
            tokio::try_join!(chain.block_number(), chain.transaction_count(agent_address))?;

        let floor = self.nonce_floor.load(Ordering::Acquire);
        if floor > 0 && account_nonce < floor - 1 {
            return Err(NegotiationError::UpstreamUnavailable(format!(
                "Node reported nonce {} below already signed nonce {}",
                account_nonce,
                floor - 1
            )));
        }

        let offer = self.build(demand, chain_height, account_nonce, agent_address)?;
        self.nonce_floor
            .fetch_max(account_nonce.saturating_add(1), Ordering::AcqRel);

        tracing::debug!(
            height = chain_height,
            nonce = account_nonce,
            deadline = offer.deadline(),
            "Built offer"
        );

        Ok(offer)
    }
}

impl Offer {
    /// Recomputes the digest under `field_order` and checks the signature
    /// recovers to `sender`.
    pub fn verify(&self, field_order: &FieldOrder) -> Result<Address> {
        let digest = offer_digest(self.terms(), field_order);
        let recovered = OfferSigner::recover(&digest, self.signature())?;

        if recovered != self.sender() {
            return Err(NegotiationError::Signing(format!(
                "Signature recovers to {} but sender is {}",
                recovered,
                self.sender()
            )));
        }

        Ok(recovered)
    }

    /// Parses a published offer and checks its signature.
    pub fn from_json(data: &[u8], field_order: &FieldOrder) -> Result<Self> {
        let payload: SignedOfferPayload = serde_json::from_slice(data)
            .map_err(|e| NegotiationError::Validation(format!("Malformed offer: {}", e)))?;

        let digest = offer_digest(&payload.terms, field_order);
        let offer = Offer::new(payload.terms, digest, payload.signature);
        offer.verify(field_order)?;
        Ok(offer)
    }
}
