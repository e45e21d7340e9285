use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel transport is unavailable")]
    Unavailable,
    #[error("failed to open channel: {0}")]
    Connect(String),
    #[error("failed to transmit frame: {0}")]
    Transmit(String),
}
