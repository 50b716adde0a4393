use thiserror::Error;
use twin_storage::StoreError;

/// DMI 错误。
#[derive(Debug, Error)]
pub enum DmiError {
    #[error("fail to get dmi client of protocol {0}")]
    NoClient(String),
    #[error("fail to get device model {0}")]
    MissingModel(String),
    #[error("device {0} has no device model reference")]
    NoModelReference(String),
    #[error("device {0} has no protocol")]
    NoProtocol(String),
    #[error("wrong resource {0}")]
    InvalidResource(String),
    #[error("invalid message content: {0}")]
    InvalidContent(String),
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
