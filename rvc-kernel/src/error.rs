use thiserror::Error;
use uuid::Uuid;

/// Erreurs du pont Matter. Seules `Connect` et `NotConnected` remontent
/// jusqu'aux appelants, les autres sont loguées puis ignorées.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("upstream server not connected")]
    NotConnected,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("status listener '{listener}' failed: {reason}")]
    ListenerFailure { listener: String, reason: String },

    #[error("subscriber {0} is gone")]
    SubscriberGone(Uuid),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
