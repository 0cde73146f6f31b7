use crate::domain::ClientId;

/// Core error type for the channel guard bot.
///
/// Transport adapters map their specific failures into `Transport` so the
/// session can tell fatal startup errors apart from per-client failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("login rejected: {0}")]
    Auth(String),

    #[error("virtual server selection failed: {0}")]
    ServerSelect(String),

    #[error("setting bot name failed: {0}")]
    Name(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("permission check failed for client {client}: {reason}")]
    PermissionCheck { client: ClientId, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("action failed: {0}")]
    Action(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
