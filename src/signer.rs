use crate::{NegotiationError, Result};
use alloy_primitives::{Address, Signature, B256};
use alloy_signer::{Signer, SignerSync};
use alloy_signer_local::PrivateKeySigner;
use std::fmt;

/// The agent's signing identity.
///
/// Signatures are EIP-191 personal-message signatures over a 32-byte digest,
/// which is what on-chain `ecrecover` with the `"\x19Ethereum Signed Message:\n32"`
/// prefix expects.
pub struct OfferSigner {
    signer: PrivateKeySigner,
}

impl OfferSigner {
    /// Accepts a hex private key with or without the `0x` prefix.
    pub fn from_hex(private_key_hex: &str) -> Result<Self> {
        if private_key_hex.trim().is_empty() {
            return Err(NegotiationError::Signing("Private key is absent".to_string()));
        }

        // The parse error can echo key material, so it is not forwarded.
        let signer = private_key_hex
            .trim()
            .parse::<PrivateKeySigner>()
            .map_err(|_| NegotiationError::Signing("Private key is malformed".to_string()))?;

        Ok(Self { signer })
    }

    #[cfg(test)]
    pub fn random() -> Self {
        Self {
            signer: PrivateKeySigner::random(),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn sign(&self, digest: &B256) -> Result<Signature> {
        let signature = self.signer.sign_message_sync(digest.as_slice())?;
        Ok(signature)
    }

    /// Recovers the address that produced `signature` over `digest`.
    pub fn recover(digest: &B256, signature: &Signature) -> Result<Address> {
        signature
            .recover_address_from_msg(digest.as_slice())
            .map_err(|e| NegotiationError::Signing(format!("Signature recovery failed: {}", e)))
    }
}

impl fmt::Debug for OfferSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfferSigner")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
