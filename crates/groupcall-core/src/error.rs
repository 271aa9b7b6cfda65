use thiserror::Error;

use crate::channel::ChannelError;
use crate::engine::EngineError;

/// Failure of a public [`SessionManager`](crate::SessionManager) operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("session already started")]
    AlreadyStarted,
    #[error("session manager has shut down")]
    ShutDown,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
