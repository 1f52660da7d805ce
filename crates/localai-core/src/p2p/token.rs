//! Shared network credentials.
//!
//! A token is the base64 of `{network_id, secret, peers}`. Everyone holding
//! the same token joins the same network; `peers` seeds gossip.

use crate::error::{LocalAiError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkToken {
    pub network_id: String,
    pub secret: String,
    /// Bootstrap gossip addresses (`host:port`).
    #[serde(default)]
    pub peers: Vec<String>,
}

impl NetworkToken {
    pub fn new(network_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            secret: secret.into(),
            peers: Vec::new(),
        }
    }

    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = |message: String| LocalAiError::InvalidToken { message };
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| invalid(format!("not base64: {}", e)))?;
        let token: Self =
            serde_json::from_slice(&bytes).map_err(|e| invalid(format!("bad payload: {}", e)))?;
        if token.network_id.is_empty() || token.secret.is_empty() {
            return Err(invalid("network id and secret are required".to_string()));
        }
        Ok(token)
    }

    pub fn encode(&self) -> String {
        // Serializing a struct of strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Bearer credential exchanged on gossip requests.
    pub fn bearer(&self) -> String {
        hex::encode(Sha256::digest(self.secret.as_bytes()))
    }

    /// Ledger bucket under which nodes of `service_id` announce themselves.
    pub fn service_key(&self, service_id: &str) -> String {
        format!("{}_{}", self.network_id, service_id)
    }
}

/// A fresh random token with no bootstrap peers.
pub fn generate_token() -> String {
    NetworkToken::new(
        uuid::Uuid::new_v4().simple().to_string(),
        uuid::Uuid::new_v4().to_string(),
    )
    .encode()
}
