use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Timeout error")]
    TimeoutError,
}
