//! Pont entre un serveur Matter (WebSocket amont) et les clients locaux :
//! API HTTP de contrôle et relais WebSocket temps réel de l'état du robot.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod http;
pub mod hub;
pub mod link;
pub mod models;
pub mod relay;
pub mod router;
pub mod session;
pub mod simulator;
pub mod state;
pub mod store;
pub mod supervisor;

pub use error::{BridgeError, BridgeResult};
pub use link::DeviceLink;
