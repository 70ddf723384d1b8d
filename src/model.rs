use crate::{NegotiationError, Result};
use alloy_primitives::{Address, Signature, B256, U256};
use serde::{Deserialize, Serialize};

/// Demand exactly as it travels on the wire. Every field is required; numeric
/// terms are hex strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandPayload {
    pub model: String,
    pub objective: String,
    pub token: String,
    pub cost: String,
    pub lighthouse: String,
    pub lighthouse_fee: String,
    pub validator: String,
    pub validator_fee: String,
}

/// A validated demand. Only constructible through [`DemandPayload`] parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "DemandPayload")]
pub struct Demand {
    pub model: String,
    pub objective: String,
    pub token: Address,
    pub cost: U256,
    pub lighthouse: Address,
    pub lighthouse_fee: U256,
    pub validator: Address,
    pub validator_fee: U256,
}

impl TryFrom<DemandPayload> for Demand {
    type Error = NegotiationError;

    fn try_from(raw: DemandPayload) -> Result<Self> {
        Ok(Self {
            token: parse_address("token", &raw.token)?,
            cost: parse_uint("cost", &raw.cost)?,
            lighthouse: parse_address("lighthouse", &raw.lighthouse)?,
            lighthouse_fee: parse_uint("lighthouseFee", &raw.lighthouse_fee)?,
            validator: parse_address("validator", &raw.validator)?,
            validator_fee: parse_uint("validatorFee", &raw.validator_fee)?,
            model: raw.model,
            objective: raw.objective,
        })
    }
}

impl Demand {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| NegotiationError::Validation(format!("Malformed demand: {}", e)))
    }
}

/// Everything an offer commits to, minus the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferTerms {
    #[serde(flatten)]
    pub demand: Demand,
    pub deadline: u64,
    pub nonce: u64,
    pub sender: Address,
}

/// A signed offer. Fields are read-only: any change requires building and
/// signing a new offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Offer {
    #[serde(flatten)]
    terms: OfferTerms,
    #[serde(with = "signature_hex")]
    signature: Signature,
    #[serde(skip)]
    digest: B256,
}

impl Offer {
    pub(crate) fn new(terms: OfferTerms, digest: B256, signature: Signature) -> Self {
        Self {
            terms,
            signature,
            digest,
        }
    }

    pub fn terms(&self) -> &OfferTerms {
        &self.terms
    }

    pub fn demand(&self) -> &Demand {
        &self.terms.demand
    }

    pub fn deadline(&self) -> u64 {
        self.terms.deadline
    }

    pub fn nonce(&self) -> u64 {
        self.terms.nonce
    }

    pub fn sender(&self) -> Address {
        self.terms.sender
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Keccak-256 of the canonical encoding the signature covers.
    pub fn digest(&self) -> B256 {
        self.digest
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// An offer as received from the wire, before its digest is recomputed.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedOfferPayload {
    #[serde(flatten)]
    pub terms: OfferTerms,
    #[serde(with = "signature_hex")]
    pub signature: Signature,
}

/// Result reference for a liability, reported by the settlement side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResultReport {
    #[serde(alias = "address")]
    pub liability: Address,
    pub result: String,
}

/// Assignment of a liability address to one of our published offers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LiabilityNotice {
    pub liability: Address,
    pub offer: B256,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SettlementMessage {
    Result(ResultReport),
    Liability(LiabilityNotice),
}

impl SettlementMessage {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let message: SettlementMessage = serde_json::from_slice(data).map_err(|e| {
            NegotiationError::Validation(format!("Malformed settlement message: {}", e))
        })?;

        if let SettlementMessage::Result(report) = &message {
            if report.result.trim().is_empty() {
                return Err(NegotiationError::Validation(
                    "Result reference cannot be empty".to_string(),
                ));
            }
        }

        Ok(message)
    }
}

pub fn parse_address(field: &str, value: &str) -> Result<Address> {
    value
        .parse::<Address>()
        .map_err(|e| NegotiationError::Validation(format!("{} is not an address: {}", field, e)))
}

/// Parses a non-negative 256-bit integer from a hex string, with or without
/// the `0x` prefix.
pub fn parse_uint(field: &str, value: &str) -> Result<U256> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    if digits.is_empty() {
        return Err(NegotiationError::Validation(format!(
            "{} is empty",
            field
        )));
    }

    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(NegotiationError::Validation(format!(
            "{} is not a hex integer: {:?}",
            field, value
        )));
    }

    if digits.trim_start_matches('0').len() > 64 {
        return Err(NegotiationError::Validation(format!(
            "{} does not fit in 256 bits",
            field
        )));
    }

    U256::from_str_radix(digits, 16)
        .map_err(|e| NegotiationError::Validation(format!("{} is out of range: {}", field, e)))
}

pub(crate) mod signature_hex {
    use alloy_primitives::Signature;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(signature: &Signature, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(signature.as_bytes())))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Signature, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(D::Error::custom)?;
        Signature::try_from(bytes.as_slice()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn demand_json() -> serde_json::Value {
        json!({
            "model": "QmModel",
            "objective": "QmObjective",
            "token": "0x1111111111111111111111111111111111111111",
            "cost": "0x64",
            "lighthouse": "0x2222222222222222222222222222222222222222",
            "lighthouseFee": "0x1",
            "validator": "0x3333333333333333333333333333333333333333",
            "validatorFee": "0x2"
        })
    }

    #[test]
    fn test_demand_parses() {
        let demand = Demand::from_json(demand_json().to_string().as_bytes()).unwrap();
        assert_eq!(demand.model, "QmModel");
        assert_eq!(demand.cost, U256::from(100));
        assert_eq!(demand.lighthouse_fee, U256::from(1));
        assert_eq!(demand.validator_fee, U256::from(2));
    }

    #[test]
    fn test_demand_missing_field_rejected() {
        let mut value = demand_json();
        value.as_object_mut().unwrap().remove("validatorFee");
        let result = Demand::from_json(value.to_string().as_bytes());
        assert!(matches!(result, Err(NegotiationError::Validation(_))));
    }

    #[test]
    fn test_demand_non_numeric_cost_rejected() {
        let mut value = demand_json();
        value["cost"] = json!("lots");
        let result = Demand::from_json(value.to_string().as_bytes());
        assert!(matches!(result, Err(NegotiationError::Validation(_))));
    }

    #[test]
    fn test_demand_numeric_json_fee_rejected() {
        let mut value = demand_json();
        value["lighthouseFee"] = json!(1);
        assert!(Demand::from_json(value.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_parse_uint() {
        assert_eq!(parse_uint("cost", "0x64").unwrap(), U256::from(100));
        assert_eq!(parse_uint("cost", "ff").unwrap(), U256::from(255));
        assert_eq!(parse_uint("cost", "0X0A").unwrap(), U256::from(10));
        assert_eq!(parse_uint("cost", &format!("0x{}", "f".repeat(64))).unwrap(), U256::MAX);
        assert_eq!(parse_uint("cost", &format!("0x000{}", "f".repeat(64))).unwrap(), U256::MAX);

        assert!(parse_uint("cost", "").is_err());
        assert!(parse_uint("cost", "0x").is_err());
        assert!(parse_uint("cost", "-0x1").is_err());
        assert!(parse_uint("cost", "0x1_000").is_err());
        assert!(parse_uint("cost", "0xzz").is_err());
        assert!(parse_uint("cost", &format!("0x1{}", "0".repeat(64))).is_err());
    }

    #[test]
    fn test_settlement_message_variants() {
        let result = SettlementMessage::from_json(
            br#"{"liability":"0x4444444444444444444444444444444444444444","result":"QmResult"}"#,
        )
        .unwrap();
        assert!(matches!(result, SettlementMessage::Result(ref r) if r.result == "QmResult"));

        let aliased = SettlementMessage::from_json(
            br#"{"address":"0x4444444444444444444444444444444444444444","result":"QmResult"}"#,
        )
        .unwrap();
        assert_eq!(result, aliased);

        let notice = SettlementMessage::from_json(
            format!(
                r#"{{"liability":"0x4444444444444444444444444444444444444444","offer":"0x{}"}}"#,
                "ab".repeat(32)
            )
            .as_bytes(),
        )
        .unwrap();
        assert!(matches!(notice, SettlementMessage::Liability(_)));
    }

    #[test]
    fn test_settlement_message_rejects_garbage() {
        assert!(SettlementMessage::from_json(br#"{"result":"QmResult"}"#).is_err());
        assert!(SettlementMessage::from_json(
            br#"{"liability":"0x4444444444444444444444444444444444444444","result":"  "}"#
        )
        .is_err());
        assert!(SettlementMessage::from_json(b"not json").is_err());
    }
}
