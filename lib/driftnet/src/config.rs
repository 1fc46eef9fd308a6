use crate::error::{ProtocolError, ProtocolResult};
use crate::server::ServerOptions;
use brine::secret::SecretKey;
use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Server-side configuration as it appears in a deployment's TOML file.
/// The private key is the one shared with the token issuer and serializes
/// as base64.
#[derive(Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub max_clients: usize,
    pub protocol_id: u64,
    pub private_key: SecretKey,
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> ProtocolResult<ServerConfig> {
        serdeconv::from_toml_str(raw).map_err(|_| ProtocolError::Malformed)
    }

    pub fn bind_address(&self) -> ProtocolResult<SocketAddr> {
        self.bind_address.parse().map_err(ProtocolError::from)
    }

    /// Resolves the textual config into socket construction options.
    pub fn options(&self) -> ProtocolResult<ServerOptions> {
        Ok(ServerOptions {
            bind_address: self.bind_address()?,
            max_clients: self.max_clients,
            protocol_id: self.protocol_id,
            private_key: *self.private_key.clone(),
        })
    }
}

/// Token-issuer configuration: everything an authenticator needs to mint
/// connect tokens for a fleet of servers.
#[derive(Serialize, Deserialize, Clone)]
pub struct TokenConfig {
    pub protocol_id: u64,
    pub private_key: SecretKey,
    /// Idle timeout handed to clients, in seconds. Zero or negative
    /// disables it.
    pub timeout_secs: i32,
    /// Token lifetime in seconds from the moment of issue.
    pub lifetime_secs: u64,
    pub addresses: Vec<String>,
}

impl TokenConfig {
    pub fn from_toml_str(raw: &str) -> ProtocolResult<TokenConfig> {
        serdeconv::from_toml_str(raw).map_err(|_| ProtocolError::Malformed)
    }

    pub fn addresses(&self) -> ProtocolResult<Vec<SocketAddr>> {
        self.addresses
            .iter()
            .map(|raw| raw.parse().map_err(ProtocolError::from))
            .collect()
    }
}
