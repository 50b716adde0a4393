//! 事件载荷：入站解析与出站构建。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::action::{DealType, ResultCode};
use crate::device::{Device, DeviceSnapshot, MsgAttr};
use crate::now_ms;
use crate::twin::{MsgTwin, TwinDoc};
use crate::validation::{validate_twin_key, validate_twin_value};

/// 所有事件载荷共有的头部。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseMessage {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl BaseMessage {
    /// 回显请求的事件 ID，时间戳取当前时间。
    pub fn reply_to(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp: now_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Unmarshal update request body failed, please check the request")]
    Unmarshal,
    #[error("Update twin error, key:twin does not exist")]
    MissingTwin,
    #[error(
        "The key of twin must only include upper or lowercase letters, number, english, and special letter - _ . , : / @ # and the length of key should be less than 128 bytes"
    )]
    InvalidKey,
    #[error(
        "The value of twin must only include upper or lowercase letters, number, english, and special letter - _ . , : / @ # and the length of value should be less than 512 bytes"
    )]
    InvalidValue,
    #[error("encode payload failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PayloadError {
    pub fn code(&self) -> ResultCode {
        match self {
            PayloadError::Encode(_) => ResultCode::Internal,
            _ => ResultCode::BadRequest,
        }
    }
}

/// 错误结果 `{event_id, timestamp, code, reason}`。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// 孪生更新请求（本地 `twin/update` 与云端 `twin/cloud_updated` 共用）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTwinUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub twin: Option<BTreeMap<String, Option<MsgTwin>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTwinResult {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub twin: BTreeMap<String, Option<MsgTwin>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTwinDelta {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub twin: BTreeMap<String, MsgTwin>,
    #[serde(default)]
    pub delta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTwinDocument {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub twin: BTreeMap<String, TwinDoc>,
}

/// 云端设备更新（属性）与本地状态更新请求。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Option<MsgAttr>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttrUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub attributes: BTreeMap<String, Option<MsgAttr>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub last_online: String,
}

/// 本地状态查询 / 更新结果。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateResult {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub device: DeviceStateInfo,
}

/// 发往云端的设备状态。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMsg {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub last_online_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub added_devices: Vec<Device>,
    #[serde(default)]
    pub removed_devices: Vec<Device>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MembershipDetail {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MembershipGetResult {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// 设备上下线事件（`$hw/events/connected/<id>`）。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedInfo {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// DMI 上报的状态更新 `{timestamp, state}`。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateReport {
    #[serde(default)]
    pub timestamp: i64,
    pub state: String,
}

/// 解析本地孪生更新请求：校验全部键与非空值。
pub fn decode_twin_update(payload: &[u8]) -> Result<DeviceTwinUpdate, PayloadError> {
    let update = decode_twin_sync(payload)?;
    if let Some(twins) = update.twin.as_ref() {
        for (key, twin) in twins {
            if !validate_twin_key(key) {
                return Err(PayloadError::InvalidKey);
            }
            let Some(twin) = twin else { continue };
            for value in [twin.expected_value(), twin.actual_value()].into_iter().flatten() {
                if !validate_twin_value(value) {
                    return Err(PayloadError::InvalidValue);
                }
            }
        }
    }
    Ok(update)
}

/// 解析云端孪生同步请求：仅做结构检查，逐属性校验留给调和阶段。
pub fn decode_twin_sync(payload: &[u8]) -> Result<DeviceTwinUpdate, PayloadError> {
    let update: DeviceTwinUpdate =
        serde_json::from_slice(payload).map_err(|_| PayloadError::Unmarshal)?;
    match update.twin.as_ref() {
        Some(twins) if !twins.is_empty() => Ok(update),
        _ => Err(PayloadError::MissingTwin),
    }
}

/// 结果载荷；本地请求（rest）不回显墓碑属性。
pub fn build_twin_result(
    base: BaseMessage,
    twins: &BTreeMap<String, Option<MsgTwin>>,
    deal_type: DealType,
) -> Result<Vec<u8>, PayloadError> {
    let twin = twins
        .iter()
        .filter(|(_, twin)| match twin {
            Some(twin) if deal_type.is_rest() => !twin.is_tombstone(),
            _ => true,
        })
        .map(|(name, twin)| (name.clone(), twin.clone()))
        .collect();
    Ok(serde_json::to_vec(&DeviceTwinResult { base, twin })?)
}

/// 增量载荷：期望值非空且与实际值不同的属性；没有差异时返回 `None`。
pub fn build_twin_delta(
    base: BaseMessage,
    twins: &BTreeMap<String, MsgTwin>,
) -> Result<Option<Vec<u8>>, PayloadError> {
    let mut twin = BTreeMap::new();
    let mut delta = BTreeMap::new();
    for (name, value) in twins {
        if value.is_tombstone() {
            continue;
        }
        let Some(expected) = value.expected_value().filter(|expected| !expected.is_empty())
        else {
            continue;
        };
        if value.actual_value() != Some(expected) {
            delta.insert(name.clone(), expected.to_string());
            twin.insert(name.clone(), value.copy(false));
        }
    }
    if delta.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_vec(&DeviceTwinDelta {
        base,
        twin,
        delta,
    })?))
}

pub fn build_twin_document(
    base: BaseMessage,
    twin: BTreeMap<String, TwinDoc>,
) -> Result<Vec<u8>, PayloadError> {
    Ok(serde_json::to_vec(&DeviceTwinDocument { base, twin })?)
}

pub fn build_error_result(
    base: BaseMessage,
    code: ResultCode,
    reason: impl Into<String>,
) -> Result<Vec<u8>, PayloadError> {
    Ok(serde_json::to_vec(&ResultPayload {
        base,
        code: Some(code.as_u16()),
        reason: reason.into(),
    })?)
}

/// 成员变更事件：墓碑渲染为 `null`，版本信息去除。
pub fn build_membership_updated(
    base: BaseMessage,
    added: &[DeviceSnapshot],
    removed: &[DeviceSnapshot],
) -> Result<Vec<u8>, PayloadError> {
    Ok(serde_json::to_vec(&MembershipUpdate {
        base,
        added_devices: added.iter().map(DeviceSnapshot::to_membership_device).collect(),
        removed_devices: removed
            .iter()
            .map(DeviceSnapshot::to_membership_device)
            .collect(),
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twin::{TwinValue, TypeMetadata};

    fn twin(expected: Option<&str>, actual: Option<&str>) -> MsgTwin {
        MsgTwin {
            expected: expected.map(|value| TwinValue::new(value, 1)),
            actual: actual.map(|value| TwinValue::new(value, 1)),
            ..MsgTwin::default()
        }
    }

    #[test]
    fn update_without_twin_is_rejected() {
        let err = decode_twin_update(br#"{"event_id":"e1"}"#).expect_err("missing");
        assert!(matches!(err, PayloadError::MissingTwin));
        let err = decode_twin_update(b"not-json").expect_err("garbage");
        assert!(matches!(err, PayloadError::Unmarshal));
        assert_eq!(err.code(), ResultCode::BadRequest);
    }

    #[test]
    fn update_rejects_bad_keys_but_sync_does_not() {
        let payload = br#"{"twin":{"bad key":{"expected":{"value":"1"}}}}"#;
        assert!(matches!(
            decode_twin_update(payload),
            Err(PayloadError::InvalidKey)
        ));
        assert!(decode_twin_sync(payload).is_ok());
    }

    #[test]
    fn null_entries_survive_decoding() {
        let update = decode_twin_update(br#"{"twin":{"gone":null}}"#).expect("decode");
        assert_eq!(update.twin.expect("twin").get("gone"), Some(&None));
    }

    #[test]
    fn delta_lists_only_diverging_properties() {
        let mut twins = BTreeMap::new();
        twins.insert("same".to_string(), twin(Some("1"), Some("1")));
        twins.insert("diff".to_string(), twin(Some("25"), Some("20")));
        twins.insert("unreported".to_string(), twin(Some("on"), None));
        twins.insert("empty".to_string(), twin(Some(""), Some("x")));
        twins.insert(
            "gone".to_string(),
            MsgTwin {
                metadata: Some(TypeMetadata::of_type("deleted")),
                ..MsgTwin::default()
            },
        );

        let bytes = build_twin_delta(BaseMessage::reply_to("e"), &twins)
            .expect("encode")
            .expect("delta");
        let delta: DeviceTwinDelta = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(delta.delta.len(), 2);
        assert_eq!(delta.delta["diff"], "25");
        assert_eq!(delta.delta["unreported"], "on");
        assert_eq!(delta.twin.len(), 2);
    }

    #[test]
    fn delta_is_suppressed_when_converged() {
        let mut twins = BTreeMap::new();
        twins.insert("same".to_string(), twin(Some("1"), Some("1")));
        assert!(
            build_twin_delta(BaseMessage::default(), &twins)
                .expect("encode")
                .is_none()
        );
    }

    #[test]
    fn rest_result_hides_tombstones_but_keeps_nulls() {
        let mut twins = BTreeMap::new();
        twins.insert(
            "gone".to_string(),
            Some(MsgTwin {
                metadata: Some(TypeMetadata::of_type("deleted")),
                ..MsgTwin::default()
            }),
        );
        twins.insert("removed".to_string(), None);
        twins.insert("kept".to_string(), Some(twin(Some("1"), None)));

        let rest = build_twin_result(BaseMessage::default(), &twins, DealType::Rest).expect("rest");
        let rest: DeviceTwinResult = serde_json::from_slice(&rest).expect("decode");
        assert!(!rest.twin.contains_key("gone"));
        assert_eq!(rest.twin.get("removed"), Some(&None));

        let sync = build_twin_result(BaseMessage::default(), &twins, DealType::Sync).expect("sync");
        let sync: DeviceTwinResult = serde_json::from_slice(&sync).expect("decode");
        assert_eq!(sync.twin.len(), 3);
    }

    #[test]
    fn error_result_carries_code_and_reason() {
        let bytes = build_error_result(
            BaseMessage::reply_to("e9"),
            ResultCode::NotFound,
            "Update rejected due to the device is not existed",
        )
        .expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(value["event_id"], "e9");
        assert_eq!(value["code"], 404);
    }
}
