//! 孪生属性模型与版本规则。
//!
//! 每个孪生属性由期望值（expected，云端写入）与实际值（actual，设备上报）两半组成，
//! 每一半各自携带 `{cloud, edge}` 版本对。删除不会移除行，而是写入墓碑：
//! 两半取值均为空且 `attr_type == "deleted"`。

use serde::{Deserialize, Serialize};

pub const TYPE_DELETED: &str = "deleted";
pub const TYPE_STRING: &str = "string";
pub const TYPE_INT: &str = "int";
pub const TYPE_FLOAT: &str = "float";
pub const TYPE_BOOLEAN: &str = "boolean";

/// 孪生版本对。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwinVersion {
    #[serde(default)]
    pub cloud: i64,
    #[serde(default)]
    pub edge: i64,
}

impl TwinVersion {
    pub fn new(cloud: i64, edge: i64) -> Self {
        Self { cloud, edge }
    }

    pub fn bump_edge(&mut self) {
        self.edge += 1;
    }

    pub fn bump_cloud(&mut self) {
        self.cloud += 1;
    }

    /// 云端版本是否不落后于本地（两个分量都不小于本地）。
    pub fn compare_with_cloud(&self, cloud: &TwinVersion) -> bool {
        self.cloud <= cloud.cloud && self.edge <= cloud.edge
    }
}

/// 类型元数据：`type` 之外的字段原样保留。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeMetadata {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub value_type: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TypeMetadata {
    pub fn of_type(value_type: impl Into<String>) -> Self {
        Self {
            value_type: value_type.into(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMetadata {
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinValue {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ValueMetadata>,
}

impl TwinValue {
    pub fn new(value: impl Into<String>, timestamp: i64) -> Self {
        Self {
            value: Some(value.into()),
            metadata: Some(ValueMetadata { timestamp }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgTwin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<TwinValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<TwinValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TypeMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<TwinVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_version: Option<TwinVersion>,
}

impl MsgTwin {
    /// 声明的值类型；未声明时为空串。
    pub fn value_type(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.value_type.as_str())
            .unwrap_or("")
    }

    pub fn is_tombstone(&self) -> bool {
        self.value_type() == TYPE_DELETED
    }

    pub fn expected_value(&self) -> Option<&str> {
        self.expected.as_ref().and_then(|half| half.value.as_deref())
    }

    pub fn actual_value(&self) -> Option<&str> {
        self.actual.as_ref().and_then(|half| half.value.as_deref())
    }

    /// 复制；`with_version == false` 时去掉两半版本。
    pub fn copy(&self, with_version: bool) -> MsgTwin {
        let mut copy = self.clone();
        if !with_version {
            copy.expected_version = None;
            copy.actual_version = None;
        }
        copy
    }
}

/// 单个属性的前后快照（document 事件）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinDoc {
    #[serde(rename = "last")]
    pub last_state: Option<MsgTwin>,
    #[serde(rename = "current")]
    pub current_state: Option<MsgTwin>,
}
