//! 设备孪生领域模型。
//!
//! 本 crate 不依赖运行时，仅包含：
//! - 模块间传递的消息模型（[`Message`]）
//! - 动作、处理类型、结果码、设备状态等封闭枚举
//! - 孪生 / 属性 / 设备的数据结构与版本规则
//! - 本地总线与云端的主题约定、事件载荷构建与校验

pub mod action;
pub mod device;
pub mod message;
pub mod payload;
pub mod topic;
pub mod twin;
pub mod validation;

pub use action::{Action, ConnectionState, DealType, DeviceState, ResultCode, WorkerKind};
pub use device::{Device, DeviceSnapshot, MsgAttr};
pub use message::{Content, Message, MessageHeader, MessageRouter, build_model_message};
pub use payload::{BaseMessage, PayloadError};
pub use twin::{MsgTwin, TwinDoc, TwinValue, TwinVersion, TypeMetadata, ValueMetadata};

/// 当前毫秒时间戳。
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
