//! 设备与属性。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::twin::{MsgTwin, TYPE_STRING, TypeMetadata};

/// 设备属性（静态配置项）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgAttr {
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TypeMetadata>,
}

impl MsgAttr {
    pub fn attr_type(&self) -> &str {
        match self.metadata.as_ref() {
            Some(metadata) if !metadata.value_type.is_empty() => metadata.value_type.as_str(),
            _ => TYPE_STRING,
        }
    }

    pub fn is_optional(&self) -> bool {
        self.optional.unwrap_or(true)
    }

    /// 去掉 `type` 后的元数据 JSON（落库的 metadata 列）。
    pub fn metadata_json(&self) -> String {
        let extra = self
            .metadata
            .as_ref()
            .map(|metadata| metadata.extra.clone())
            .unwrap_or_default();
        serde_json::Value::Object(extra).to_string()
    }
}

/// 线上传输的设备描述（云端成员关系、成员变更事件）。
///
/// 属性与孪生的值允许为 `null`：入站时表示删除，出站时表示墓碑。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_online: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Option<MsgAttr>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub twin: BTreeMap<String, Option<MsgTwin>>,
}

/// 内存中的设备快照。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub state: String,
    pub last_online: String,
    pub attributes: BTreeMap<String, MsgAttr>,
    pub twin: BTreeMap<String, MsgTwin>,
}

impl DeviceSnapshot {
    /// 由入站设备描述构造；空值条目被忽略。
    pub fn from_device(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            description: device.description.clone(),
            state: device.state.clone(),
            last_online: device.last_online.clone(),
            attributes: device
                .attributes
                .iter()
                .filter_map(|(name, attr)| attr.clone().map(|attr| (name.clone(), attr)))
                .collect(),
            twin: device
                .twin
                .iter()
                .filter_map(|(name, twin)| twin.clone().map(|twin| (name.clone(), twin)))
                .collect(),
        }
    }

    /// 成员变更事件中的设备：墓碑渲染为 `null`，版本信息去除。
    pub fn to_membership_device(&self) -> Device {
        Device {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            state: self.state.clone(),
            last_online: self.last_online.clone(),
            attributes: self
                .attributes
                .iter()
                .map(|(name, attr)| (name.clone(), Some(attr.clone())))
                .collect(),
            twin: self
                .twin
                .iter()
                .map(|(name, twin)| {
                    let rendered = if twin.is_tombstone() {
                        None
                    } else {
                        Some(twin.copy(false))
                    };
                    (name.clone(), rendered)
                })
                .collect(),
        }
    }
}
