//! PigeonHub signaling server
//!
//! WebSocket signaling and peer discovery for WebRTC clients. Peers
//! announce into named networks, discover each other, and exchange opaque
//! offer / answer / ICE payloads. In hub mode the server dials bootstrap
//! hubs and forms a mesh that propagates discovery and relays signaling
//! whose target is not local.

pub mod config;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod hub_mesh;
pub mod metrics;
pub mod models;
pub mod peer_id;
pub mod registry;
pub mod server;
pub mod signaling;
pub mod state;

pub use config::ServerConfig;
pub use server::{app, Server};
