//! 封闭枚举：动作、Worker、处理类型、结果码、设备状态。

use std::fmt;
use std::str::FromStr;

/// Worker 种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerKind {
    Twin,
    Device,
    Membership,
    Comm,
    Dmi,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 5] = [
        WorkerKind::Twin,
        WorkerKind::Device,
        WorkerKind::Membership,
        WorkerKind::Comm,
        WorkerKind::Dmi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Twin => "twin",
            WorkerKind::Device => "device",
            WorkerKind::Membership => "membership",
            WorkerKind::Comm => "comm",
            WorkerKind::Dmi => "dmi",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 路由分类后的动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    TwinGet,
    TwinUpdate,
    TwinCloudSync,
    DeviceUpdated,
    DeviceStateUpdate,
    DeviceStateGet,
    MemGet,
    MemUpdated,
    MemDetailResult,
    SendToCloud,
    SendToEdge,
    LifeCycle,
    Confirm,
    MetaDeviceOperation,
}

impl Action {
    /// 动作归属的 Worker。
    pub fn worker(self) -> WorkerKind {
        match self {
            Action::TwinGet | Action::TwinUpdate | Action::TwinCloudSync => WorkerKind::Twin,
            Action::DeviceUpdated | Action::DeviceStateUpdate | Action::DeviceStateGet => {
                WorkerKind::Device
            }
            Action::MemGet | Action::MemUpdated | Action::MemDetailResult => {
                WorkerKind::Membership
            }
            Action::SendToCloud | Action::SendToEdge | Action::LifeCycle | Action::Confirm => {
                WorkerKind::Comm
            }
            Action::MetaDeviceOperation => WorkerKind::Dmi,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::TwinGet => "TwinGet",
            Action::TwinUpdate => "TwinUpdate",
            Action::TwinCloudSync => "TwinCloudSync",
            Action::DeviceUpdated => "DeviceUpdated",
            Action::DeviceStateUpdate => "DeviceStateUpdate",
            Action::DeviceStateGet => "DeviceStateGet",
            Action::MemGet => "MemGet",
            Action::MemUpdated => "MemUpdated",
            Action::MemDetailResult => "MemDetailResult",
            Action::SendToCloud => "SendToCloud",
            Action::SendToEdge => "SendToEdge",
            Action::LifeCycle => "LifeCycle",
            Action::Confirm => "Confirm",
            Action::MetaDeviceOperation => "MetaDeviceOperation",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 孪生处理类型：rest 为本地发起，其余为云端发起。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealType {
    Rest,
    Sync,
    Detail,
    SyncDelete,
}

impl DealType {
    pub fn code(self) -> u8 {
        match self {
            DealType::Rest => 0,
            DealType::Sync => 1,
            DealType::Detail => 2,
            DealType::SyncDelete => 3,
        }
    }

    pub fn is_rest(self) -> bool {
        matches!(self, DealType::Rest)
    }
}

/// 结果码（HTTP 语义）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    BadRequest,
    NotFound,
    Conflict,
    Internal,
}

impl ResultCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ResultCode::Ok => 200,
            ResultCode::BadRequest => 400,
            ResultCode::NotFound => 404,
            ResultCode::Conflict => 409,
            ResultCode::Internal => 500,
        }
    }
}

/// 设备状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Offline,
    Ok,
    Unknown,
    Disconnected,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Online => "online",
            DeviceState::Offline => "offline",
            DeviceState::Ok => "ok",
            DeviceState::Unknown => "unknown",
            DeviceState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported device state: {0}")]
pub struct InvalidDeviceState(pub String);

impl FromStr for DeviceState {
    type Err = InvalidDeviceState;

    /// 大小写不敏感解析。
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(DeviceState::Online),
            "offline" => Ok(DeviceState::Offline),
            "ok" => Ok(DeviceState::Ok),
            "unknown" => Ok(DeviceState::Unknown),
            "disconnected" => Ok(DeviceState::Disconnected),
            _ => Err(InvalidDeviceState(value.to_string())),
        }
    }
}

/// 节点与云端的连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}
