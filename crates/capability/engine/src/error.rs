use domain::{PayloadError, ResultCode, WorkerKind};
use thiserror::Error;
use twin_bus::BusError;
use twin_dmi::DmiError;
use twin_storage::StoreError;

/// 孪生引擎错误。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dmi error: {0}")]
    Dmi(#[from] DmiError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("queue of worker {0} closed")]
    QueueClosed(WorkerKind),
    #[error("worker stopped")]
    Stopped,
}

impl EngineError {
    /// 结果载荷中的错误码。
    pub fn code(&self) -> ResultCode {
        match self {
            EngineError::BadRequest(_) => ResultCode::BadRequest,
            EngineError::NotFound(_) => ResultCode::NotFound,
            EngineError::Conflict(_) => ResultCode::Conflict,
            EngineError::Payload(err) => err.code(),
            _ => ResultCode::Internal,
        }
    }

    pub fn device_not_found(device_id: &str) -> Self {
        EngineError::NotFound(format!(
            "Update rejected due to the device {device_id} is not existed"
        ))
    }
}
