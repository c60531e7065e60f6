//! # WebSocket Gateway
//!
//! Serves the prompt page, accepts websocket clients, and streams each
//! backend result followed by the final "Best Model" event. One
//! [`SessionChannel`](crate::session::SessionChannel) per connection.

mod connection;
mod events;
mod server;

pub use connection::ConnectionManager;
pub use events::{BEST_MODEL, ClientMessage, ERROR_MODEL, ServerMessage};
pub use server::{
    GatewayServer, SharedGateway, WsSink, router as gateway_router, run as run_gateway,
    serve as serve_gateway,
};

use serde::{Deserialize, Serialize};

/// Configuration for the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_connections: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_connections, 64);
    }

    #[test]
    fn test_gateway_config_serialization() {
        let config = GatewayConfig {
            host: "0.0.0.0".into(),
            port: 9090,
            max_connections: 5,
        };
        let json = serde_json::to_string(&config).unwrap();
        let restored: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.host, "0.0.0.0");
        assert_eq!(restored.port, 9090);
        assert_eq!(restored.max_connections, 5);
    }
}
