// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use tracing::warn;
use uuid::Uuid;

use crate::domain::error::MarketplaceError;
use crate::domain::handoff::HandoffClaims;

/// HS256 signer for handoff tokens.
///
/// `exp` is not validated here; the coordinator checks it with zero leeway and
/// reports it as `TokenInvalid`. Everything this signer rejects is a signature
/// failure.
pub struct HandoffSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl HandoffSigner {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Signer with a process-local random secret. Tokens do not survive a
    /// restart and cannot be verified by other registry instances.
    pub fn ephemeral() -> Self {
        warn!("No handoff signing secret configured; using an ephemeral key");
        let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        Self::new(secret.as_bytes())
    }

    pub fn sign(&self, claims: &HandoffClaims) -> Result<String, MarketplaceError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| MarketplaceError::Unavailable(format!("failed to sign handoff token: {}", e)))
    }

    pub fn verify(&self, token: &str) -> Result<HandoffClaims, MarketplaceError> {
        decode::<HandoffClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    MarketplaceError::TokenSignature("signature mismatch".to_string())
                }
                _ => MarketplaceError::TokenSignature(format!("malformed token: {}", e)),
            })
    }
}
