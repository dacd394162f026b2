// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Device identity used to sign the connect handshake

use crate::error::{RelayError, RelayResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Signs handshake payloads on behalf of this relay instance
pub trait DeviceSigner: Send + Sync {
    /// Stable identifier presented as `device.id`
    fn device_id(&self) -> String;

    /// Raw public key, base64url without padding
    fn public_key(&self) -> String;

    /// Signature over `payload`, base64url without padding
    fn sign(&self, payload: &str) -> RelayResult<String>;
}

/// Fields covered by the device signature
#[derive(Debug, Clone)]
pub struct AuthPayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: i64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

impl AuthPayload<'_> {
    /// Pipe-delimited canonical form. `v2` includes the challenge nonce,
    /// `v1` is used when no nonce was issued.
    pub fn canonical(&self) -> String {
        let version = if self.nonce.is_some() { "v2" } else { "v1" };
        let mut parts = vec![
            version.to_string(),
            self.device_id.to_string(),
            self.client_id.to_string(),
            self.client_mode.to_string(),
            self.role.to_string(),
            self.scopes.join(","),
            self.signed_at_ms.to_string(),
            self.token.unwrap_or_default().to_string(),
        ];
        if let Some(nonce) = self.nonce {
            parts.push(nonce.to_string());
        }
        parts.join("|")
    }
}

/// Ed25519 key pair; the device id is the hex SHA-256 of the raw public key
pub struct Ed25519DeviceIdentity {
    signing_key: SigningKey,
}

impl std::fmt::Debug for Ed25519DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519DeviceIdentity")
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

impl Ed25519DeviceIdentity {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Fresh key for this process only
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self::from_signing_key(SigningKey::generate(&mut rng))
    }

    /// Parse a hex-encoded 32-byte secret key
    pub fn from_hex(secret: &str) -> RelayResult<Self> {
        let bytes = hex::decode(secret.trim()).map_err(|e| RelayError::Signing {
            message: format!("device key is not valid hex: {e}"),
        })?;
        let secret: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| RelayError::Signing {
            message: format!("device key must be 32 bytes, got {}", bytes.len()),
        })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    pub fn load(path: &Path) -> RelayResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_hex(&contents)
    }

    /// Load the configured key, or fall back to an ephemeral one
    pub fn load_or_generate(path: Option<&Path>) -> RelayResult<Self> {
        match path {
            Some(path) => {
                let identity = Self::load(path)?;
                tracing::info!(device_id = %identity.device_id(), path = %path.display(), "Loaded device key");
                Ok(identity)
            }
            None => {
                let identity = Self::generate();
                tracing::info!(device_id = %identity.device_id(), "Generated ephemeral device key");
                Ok(identity)
            }
        }
    }
}

impl DeviceSigner for Ed25519DeviceIdentity {
    fn device_id(&self) -> String {
        let public = self.signing_key.verifying_key().to_bytes();
        hex::encode(Sha256::digest(public))
    }

    fn public_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, payload: &str) -> RelayResult<String> {
        let signature = self.signing_key.sign(payload.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(signature.to_bytes()))
    }
}
