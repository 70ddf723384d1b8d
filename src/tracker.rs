use crate::{model::Offer, NegotiationError, Result};
use alloy_primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

const MAX_ANOMALIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    Pending,
    Active,
    Completed,
    Expired,
}

impl NegotiationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationStatus::Completed | NegotiationStatus::Expired)
    }
}

#[derive(Debug, Clone)]
pub struct Negotiation {
    pub liability: Option<Address>,
    pub offer: Arc<Offer>,
    pub result: Option<String>,
    pub status: NegotiationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Negotiation {
    fn new(offer: Arc<Offer>) -> Self {
        let now = Utc::now();
        Self {
            liability: None,
            offer,
            result: None,
            status: NegotiationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, status: NegotiationStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn deadline(&self) -> u64 {
        self.offer.deadline()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    UnknownLiability,
    NotActive(NegotiationStatus),
    ConflictingResult,
}

/// A result that could not be correlated to an active negotiation.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub liability: Address,
    pub result: String,
    pub reason: MismatchReason,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    Completed,
    /// Same result already recorded for this liability.
    Duplicate,
    Mismatched(MismatchReason),
}

/// In-memory view of outstanding negotiations.
///
/// Pending negotiations are keyed by offer digest until a liability address
/// is assigned; from then on they are keyed by that address, and `assigned`
/// remembers which address each digest went to. Callers serialize access
/// (the agent keeps this behind a mutex).
#[derive(Debug, Default)]
pub struct CorrelationTracker {
    pending: HashMap<B256, Negotiation>,
    by_liability: HashMap<Address, Negotiation>,
    assigned: HashMap<B256, Address>,
    anomalies: VecDeque<Anomaly>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a published offer as pending. Tracking an offer that is
    /// already known, pending or assigned, is a no-op.
    pub fn track(&mut self, offer: Arc<Offer>) -> B256 {
        let digest = offer.digest();
        if self.assigned.contains_key(&digest) {
            return digest;
        }
        self.pending
            .entry(digest)
            .or_insert_with(|| Negotiation::new(offer));
        digest
    }

    /// Forgets a pending offer that never made it onto the wire.
    pub fn discard(&mut self, offer_digest: &B256) -> bool {
        match self.pending.get(offer_digest) {
            Some(n) if n.status == NegotiationStatus::Pending => {
                self.pending.remove(offer_digest);
                true
            }
            _ => false,
        }
    }

    pub fn activate(&mut self, offer_digest: B256, liability: Address) -> Result<()> {
        if self.by_liability.contains_key(&liability) {
            return Err(NegotiationError::Validation(format!(
                "Liability {} is already assigned",
                liability
            )));
        }

        if let Some(existing) = self.assigned.get(&offer_digest) {
            return Err(NegotiationError::Validation(format!(
                "Offer {} is already assigned to liability {}",
                offer_digest, existing
            )));
        }

        let status = self
            .pending
            .get(&offer_digest)
            .map(|n| n.status)
            .ok_or_else(|| {
                NegotiationError::Validation(format!("No pending offer {}", offer_digest))
            })?;

        if status != NegotiationStatus::Pending {
            return Err(NegotiationError::Validation(format!(
                "Offer {} is {:?}, cannot activate",
                offer_digest, status
            )));
        }

        if let Some(mut negotiation) = self.pending.remove(&offer_digest) {
            negotiation.liability = Some(liability);
            negotiation.transition(NegotiationStatus::Active);
            self.assigned.insert(offer_digest, liability);
            self.by_liability.insert(liability, negotiation);
        }

        tracing::info!(liability = %liability, offer = %offer_digest, "Negotiation active");
        Ok(())
    }

    pub fn record_result(&mut self, liability: Address, result: &str) -> Correlation {
        let outcome = match self.by_liability.get_mut(&liability) {
            None => Correlation::Mismatched(MismatchReason::UnknownLiability),
            Some(n) => match n.status {
                NegotiationStatus::Active => {
                    n.result = Some(result.to_string());
                    n.transition(NegotiationStatus::Completed);
                    Correlation::Completed
                }
                NegotiationStatus::Completed if n.result.as_deref() == Some(result) => {
                    Correlation::Duplicate
                }
                NegotiationStatus::Completed => {
                    Correlation::Mismatched(MismatchReason::ConflictingResult)
                }
                status => Correlation::Mismatched(MismatchReason::NotActive(status)),
            },
        };

        if let Correlation::Mismatched(reason) = &outcome {
            tracing::warn!(liability = %liability, reason = ?reason, "Unmatched result");
            self.push_anomaly(Anomaly {
                liability,
                result: result.to_string(),
                reason: reason.clone(),
                observed_at: Utc::now(),
            });
        }

        outcome
    }

    /// Expires every open negotiation whose deadline is below `height`.
    /// Returns how many changed state.
    pub fn expire(&mut self, height: u64) -> usize {
        let mut expired = 0;

        for negotiation in self
            .pending
            .values_mut()
            .chain(self.by_liability.values_mut())
        {
            if !negotiation.status.is_terminal() && height > negotiation.deadline() {
                negotiation.transition(NegotiationStatus::Expired);
                expired += 1;
            }
        }

        if expired > 0 {
            tracing::info!(height, expired, "Expired negotiations");
        }
        expired
    }

    /// Drops terminal negotiations whose deadline is more than `retention`
    /// blocks behind `height`.
    pub fn prune(&mut self, height: u64, retention: u64) -> usize {
        let keep = |n: &Negotiation| {
            !n.status.is_terminal() || height <= n.deadline().saturating_add(retention)
        };

        let before = self.pending.len() + self.by_liability.len();
        self.pending.retain(|_, n| keep(n));
        self.by_liability.retain(|_, n| keep(n));
        let by_liability = &self.by_liability;
        self.assigned
            .retain(|_, liability| by_liability.contains_key(liability));
        before - (self.pending.len() + self.by_liability.len())
    }

    pub fn get(&self, liability: &Address) -> Option<&Negotiation> {
        self.by_liability.get(liability)
    }

    pub fn get_pending(&self, offer_digest: &B256) -> Option<&Negotiation> {
        self.pending.get(offer_digest)
    }

    /// Whether the offer is tracked at all, pending or under a liability.
    pub fn contains(&self, offer_digest: &B256) -> bool {
        self.pending.contains_key(offer_digest) || self.assigned.contains_key(offer_digest)
    }

    pub fn anomalies(&self) -> impl Iterator<Item = &Anomaly> {
        self.anomalies.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.by_liability.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_anomaly(&mut self, anomaly: Anomaly) {
        if self.anomalies.len() == MAX_ANOMALIES {
            self.anomalies.pop_front();
        }
        self.anomalies.push_back(anomaly);
    }
}
