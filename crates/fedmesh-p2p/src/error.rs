use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum OverlayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("keypair error: {0}")]
    Keypair(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("bootstrap unreachable: {0}")]
    BootstrapUnreachable(String),

    #[error("no peers subscribed to topic {0}")]
    NoPeers(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("node already shut down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for OverlayError {
    fn from(e: std::io::Error) -> Self {
        OverlayError::Io(e.to_string())
    }
}
