//! 模块间消息模型。

use serde::Serialize;

use crate::now_ms;

/// 本模块名（出站消息的 source）。
pub const TWIN_MODULE: &str = "twin";
/// 孪生组（DMI 上报、总线入站消息投递的目标组）。
pub const TWIN_GROUP: &str = "twin";
pub const BUS_SOURCE: &str = "bus";
pub const BUS_GROUP: &str = "bus";
pub const USER_GROUP: &str = "user";
pub const RESOURCE_GROUP: &str = "resource";
pub const EDGE_MANAGER_SOURCE: &str = "edgemgr";
pub const DEVICE_CONTROLLER_SOURCE: &str = "devicecontroller";
pub const EDGE_HUB_SOURCE: &str = "edgehub";
pub const META_MANAGER_SOURCE: &str = "metamanager";

pub const OP_PUBLISH: &str = "publish";
pub const OP_RESPONSE: &str = "response";
pub const OP_UPDATE: &str = "update";
pub const OP_GET: &str = "get";
pub const OP_INSERT: &str = "insert";
pub const OP_DELETE: &str = "delete";

/// 云端连接事件内容。
pub const CLOUD_CONNECTED: &str = "cloud_connected";
pub const CLOUD_DISCONNECTED: &str = "cloud_disconnected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: String,
    pub parent_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageRouter {
    pub source: String,
    pub group: String,
    pub resource: String,
    pub operation: String,
}

/// 消息体：原始字节、文本或任意 JSON 对象。
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Default for Content {
    fn default() -> Self {
        Content::Bytes(Vec::new())
    }
}

impl Content {
    /// 序列化任意对象为 JSON 内容。
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Content::Json(serde_json::to_value(value)?))
    }

    /// 归一化为字节：文本按 UTF-8，JSON 对象重新编码。
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Content::Bytes(bytes) => Ok(bytes.clone()),
            Content::Text(text) => Ok(text.as_bytes().to_vec()),
            Content::Json(value) => serde_json::to_vec(value),
        }
    }

    /// 文本视图；字节内容按 UTF-8 尝试解释。
    pub fn as_text(&self) -> Option<String> {
        match self {
            Content::Bytes(bytes) => String::from_utf8(bytes.clone()).ok(),
            Content::Text(text) => Some(text.clone()),
            Content::Json(serde_json::Value::String(text)) => Some(text.clone()),
            Content::Json(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub router: MessageRouter,
    pub content: Content,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// 新消息：随机 ID + 当前时间戳。
    pub fn new() -> Self {
        Self {
            header: MessageHeader {
                id: uuid::Uuid::new_v4().to_string(),
                parent_id: String::new(),
                timestamp: now_ms(),
            },
            router: MessageRouter::default(),
            content: Content::default(),
        }
    }

    pub fn build_router(
        mut self,
        source: impl Into<String>,
        group: impl Into<String>,
        resource: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        self.router = MessageRouter {
            source: source.into(),
            group: group.into(),
            resource: resource.into(),
            operation: operation.into(),
        };
        self
    }

    pub fn fill_body(mut self, content: Content) -> Self {
        self.content = content;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.header.parent_id = parent_id.into();
        self
    }

    /// 以当前消息为父消息构造响应。
    pub fn new_respond(&self) -> Self {
        Self::new().with_parent(self.header.id.clone())
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn parent_id(&self) -> &str {
        &self.header.parent_id
    }

    pub fn source(&self) -> &str {
        &self.router.source
    }

    pub fn group(&self) -> &str {
        &self.router.group
    }

    pub fn resource(&self) -> &str {
        &self.router.resource
    }

    pub fn operation(&self) -> &str {
        &self.router.operation
    }
}

/// 本模块发出的出站消息（source 固定为 twin）。
pub fn build_model_message(
    group: &str,
    parent_id: &str,
    resource: &str,
    operation: &str,
    content: Content,
) -> Message {
    Message::new()
        .with_parent(parent_id)
        .build_router(TWIN_MODULE, group, resource, operation)
        .fill_body(content)
}
