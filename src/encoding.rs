//! Canonical, order-sensitive encoding of offer terms.
//!
//! The layout is Solidity's `abi.encodePacked`: strings as their raw bytes,
//! addresses as 20 bytes, integers as 32-byte big-endian words. The order of
//! fields is part of the protocol and is versioned through [`FieldOrder`].

use crate::{model::OfferTerms, NegotiationError, Result};
use alloy_primitives::{keccak256, Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OfferField {
    Model,
    Objective,
    Token,
    Cost,
    Lighthouse,
    LighthouseFee,
    Validator,
    ValidatorFee,
    Deadline,
    Nonce,
    Sender,
}

impl OfferField {
    pub fn name(&self) -> &'static str {
        match self {
            OfferField::Model => "model",
            OfferField::Objective => "objective",
            OfferField::Token => "token",
            OfferField::Cost => "cost",
            OfferField::Lighthouse => "lighthouse",
            OfferField::LighthouseFee => "lighthouseFee",
            OfferField::Validator => "validator",
            OfferField::ValidatorFee => "validatorFee",
            OfferField::Deadline => "deadline",
            OfferField::Nonce => "nonce",
            OfferField::Sender => "sender",
        }
    }
}

impl fmt::Display for OfferField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered set of fields covered by an offer signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOrder(Vec<OfferField>);

impl FieldOrder {
    /// First protocol revision: no validator fee, validator before lighthouse.
    pub fn v1() -> Self {
        use OfferField::*;
        Self(vec![
            Model,
            Objective,
            Token,
            Cost,
            Validator,
            Lighthouse,
            LighthouseFee,
            Deadline,
            Nonce,
            Sender,
        ])
    }

    /// Second revision: validator fee replaces lighthouse fee.
    pub fn v2() -> Self {
        use OfferField::*;
        Self(vec![
            Model,
            Objective,
            Token,
            Cost,
            Lighthouse,
            Validator,
            ValidatorFee,
            Deadline,
            Nonce,
            Sender,
        ])
    }

    /// Current revision: every term is signed.
    pub fn v3() -> Self {
        use OfferField::*;
        Self(vec![
            Model,
            Objective,
            Token,
            Cost,
            Lighthouse,
            LighthouseFee,
            Validator,
            ValidatorFee,
            Deadline,
            Nonce,
            Sender,
        ])
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "v1" => Some(Self::v1()),
            "v2" => Some(Self::v2()),
            "v3" => Some(Self::v3()),
            _ => None,
        }
    }

    pub fn custom(fields: Vec<OfferField>) -> Result<Self> {
        let order = Self(fields);
        order.validate()?;
        Ok(order)
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(NegotiationError::Config("Field order cannot be empty".to_string()));
        }

        for (i, field) in self.0.iter().enumerate() {
            if self.0[..i].contains(field) {
                return Err(NegotiationError::Config(format!(
                    "Field {} appears more than once in the field order",
                    field
                )));
            }
        }

        for required in [OfferField::Deadline, OfferField::Nonce, OfferField::Sender] {
            if !self.0.contains(&required) {
                return Err(NegotiationError::Config(format!(
                    "Field order must include {}",
                    required
                )));
            }
        }

        Ok(())
    }

    pub fn fields(&self) -> &[OfferField] {
        &self.0
    }
}

impl Default for FieldOrder {
    fn default() -> Self {
        Self::v3()
    }
}

impl FromStr for FieldOrder {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::preset(s).ok_or_else(|| {
            NegotiationError::Config(format!("Unknown field order preset: {}", s))
        })
    }
}

/// Config form of a field order: a preset name or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldOrderSpec {
    Preset(String),
    Fields(Vec<OfferField>),
}

impl Default for FieldOrderSpec {
    fn default() -> Self {
        FieldOrderSpec::Preset("v3".to_string())
    }
}

impl FieldOrderSpec {
    pub fn resolve(&self) -> Result<FieldOrder> {
        match self {
            FieldOrderSpec::Preset(name) => name.parse(),
            FieldOrderSpec::Fields(fields) => FieldOrder::custom(fields.clone()),
        }
    }
}

/// Packed encoder for the three field types offers use.
#[derive(Debug, Default)]
pub struct PackedEncoder {
    buf: Vec<u8>,
}

impl PackedEncoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn push_address(&mut self, address: &Address) {
        self.buf.extend_from_slice(address.as_slice());
    }

    pub fn push_uint(&mut self, value: U256) {
        let word: [u8; 32] = value.to_be_bytes::<32>();
        self.buf.extend_from_slice(&word);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub fn encode_terms(terms: &OfferTerms, order: &FieldOrder) -> Vec<u8> {
    let demand = &terms.demand;
    let mut enc = PackedEncoder::new();

    for field in order.fields() {
        match field {
            OfferField::Model => enc.push_bytes(demand.model.as_bytes()),
            OfferField::Objective => enc.push_bytes(demand.objective.as_bytes()),
            OfferField::Token => enc.push_address(&demand.token),
            OfferField::Cost => enc.push_uint(demand.cost),
            OfferField::Lighthouse => enc.push_address(&demand.lighthouse),
            OfferField::LighthouseFee => enc.push_uint(demand.lighthouse_fee),
            OfferField::Validator => enc.push_address(&demand.validator),
            OfferField::ValidatorFee => enc.push_uint(demand.validator_fee),
            OfferField::Deadline => enc.push_uint(U256::from(terms.deadline)),
            OfferField::Nonce => enc.push_uint(U256::from(terms.nonce)),
            OfferField::Sender => enc.push_address(&terms.sender),
        }
    }

    enc.finish()
}

/// Keccak-256 of the canonical encoding.
pub fn offer_digest(terms: &OfferTerms, order: &FieldOrder) -> B256 {
    keccak256(encode_terms(terms, order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Demand;
    use alloy_primitives::address;

    fn terms() -> OfferTerms {
        OfferTerms {
            demand: Demand {
                model: "m1".to_string(),
                objective: "o1".to_string(),
                token: address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
                cost: U256::from(100),
                lighthouse: address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
                lighthouse_fee: U256::from(1),
                validator: address!("cccccccccccccccccccccccccccccccccccccccc"),
                validator_fee: U256::from(2),
            },
            deadline: 2000,
            nonce: 5,
            sender: address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"),
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let order = FieldOrder::v3();
        assert_eq!(encode_terms(&terms(), &order), encode_terms(&terms(), &order));
        assert_eq!(offer_digest(&terms(), &order), offer_digest(&terms(), &order));
    }

    #[test]
    fn test_packed_layout() {
        let encoded = encode_terms(&terms(), &FieldOrder::v3());
        // two 2-byte strings, four addresses, five words
        assert_eq!(encoded.len(), 4 + 4 * 20 + 5 * 32);
        assert_eq!(&encoded[..4], b"m1o1");
        assert_eq!(&encoded[4..24], &[0xaa; 20]);
        let cost_word = &encoded[24..56];
        assert_eq!(cost_word[31], 100);
        assert!(cost_word[..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_swapping_fields_changes_digest() {
        let base = FieldOrder::v3();
        let base_digest = offer_digest(&terms(), &base);
        let n = base.fields().len();

        for i in 0..n {
            for j in (i + 1)..n {
                let mut fields = base.fields().to_vec();
                fields.swap(i, j);
                let swapped = FieldOrder::custom(fields).unwrap();
                assert_ne!(
                    offer_digest(&terms(), &swapped),
                    base_digest,
                    "swapping {} and {} kept the digest",
                    base.fields()[i],
                    base.fields()[j]
                );
            }
        }
    }

    #[test]
    fn test_value_change_changes_digest() {
        let order = FieldOrder::v3();
        let mut changed = terms();
        changed.nonce += 1;
        assert_ne!(offer_digest(&terms(), &order), offer_digest(&changed, &order));

        let mut changed = terms();
        changed.demand.lighthouse_fee = U256::from(3);
        assert_ne!(offer_digest(&terms(), &order), offer_digest(&changed, &order));
    }

    #[test]
    fn test_versions_differ_in_lighthouse_fee() {
        let mut changed = terms();
        changed.demand.lighthouse_fee = U256::from(99);

        // v2 does not sign the lighthouse fee, v1 and v3 do
        assert_eq!(
            offer_digest(&terms(), &FieldOrder::v2()),
            offer_digest(&changed, &FieldOrder::v2())
        );
        assert_ne!(
            offer_digest(&terms(), &FieldOrder::v1()),
            offer_digest(&changed, &FieldOrder::v1())
        );
    }

    #[test]
    fn test_field_order_validation() {
        assert!(FieldOrder::custom(vec![]).is_err());
        assert!(FieldOrder::custom(vec![OfferField::Model, OfferField::Nonce]).is_err());
        assert!(FieldOrder::custom(vec![
            OfferField::Deadline,
            OfferField::Nonce,
            OfferField::Sender,
            OfferField::Nonce,
        ])
        .is_err());
        assert!(FieldOrder::custom(vec![
            OfferField::Cost,
            OfferField::Deadline,
            OfferField::Nonce,
            OfferField::Sender,
        ])
        .is_ok());
    }

    #[test]
    fn test_field_order_spec_resolves() {
        assert_eq!(FieldOrderSpec::default().resolve().unwrap(), FieldOrder::v3());
        assert_eq!(
            FieldOrderSpec::Preset("v2".to_string()).resolve().unwrap(),
            FieldOrder::v2()
        );
        assert!(FieldOrderSpec::Preset("v9".to_string()).resolve().is_err());

        let spec: FieldOrderSpec =
            serde_json::from_str(r#"["model","deadline","nonce","sender"]"#).unwrap();
        assert_eq!(spec.resolve().unwrap().fields().len(), 4);
    }
}
