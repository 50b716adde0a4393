//! 内存快照与表行之间的转换。
//!
//! 列级更新由新旧两行逐列比较得出，只写发生变化的列。

use crate::context::TwinContext;
use crate::error::EngineError;
use domain::twin::TYPE_STRING;
use domain::{DeviceSnapshot, MsgAttr, MsgTwin, TwinValue, TypeMetadata};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use tracing::info;
use twin_storage::{
    AttrColumn, ColumnSet, ColumnValue, DeviceAttrRow, DeviceColumn, DeviceRow, DeviceTwinRow,
    TwinColumn, TwinStore,
};

fn to_json<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

fn from_json<T: DeserializeOwned>(text: Option<&str>) -> Option<T> {
    text.and_then(|text| serde_json::from_str(text).ok())
}

fn extra_json(metadata: Option<&TypeMetadata>) -> String {
    let extra = metadata
        .map(|metadata| metadata.extra.clone())
        .unwrap_or_default();
    serde_json::Value::Object(extra).to_string()
}

fn type_metadata(attr_type: &str, extra: Option<&str>) -> TypeMetadata {
    let attr_type = if attr_type.is_empty() {
        TYPE_STRING
    } else {
        attr_type
    };
    TypeMetadata {
        value_type: attr_type.to_string(),
        extra: from_json(extra).unwrap_or_default(),
    }
}

pub fn device_row(device: &DeviceSnapshot) -> DeviceRow {
    DeviceRow {
        id: device.id.clone(),
        name: device.name.clone(),
        description: device.description.clone(),
        state: device.state.clone(),
        last_online: device.last_online.clone(),
    }
}

pub fn attr_row(device_id: &str, name: &str, attr: &MsgAttr) -> DeviceAttrRow {
    DeviceAttrRow {
        device_id: device_id.to_string(),
        name: name.to_string(),
        value: attr.value.clone(),
        optional: attr.is_optional(),
        attr_type: attr.attr_type().to_string(),
        metadata: attr.metadata_json(),
        ..DeviceAttrRow::default()
    }
}

pub fn attr_from_row(row: &DeviceAttrRow) -> MsgAttr {
    MsgAttr {
        value: row.value.clone(),
        optional: Some(row.optional),
        metadata: Some(type_metadata(&row.attr_type, Some(&row.metadata))),
    }
}

/// 墓碑的取值与元数据列写为 NULL。
pub fn twin_row(device_id: &str, name: &str, twin: &MsgTwin) -> DeviceTwinRow {
    let value_type = match twin.value_type() {
        "" => TYPE_STRING,
        value_type => value_type,
    };
    let half_meta = |half: Option<&TwinValue>| {
        half.and_then(|half| half.metadata.as_ref())
            .and_then(to_json)
    };
    DeviceTwinRow {
        device_id: device_id.to_string(),
        name: name.to_string(),
        expected: twin.expected_value().map(str::to_string),
        actual: twin.actual_value().map(str::to_string),
        expected_meta: half_meta(twin.expected.as_ref()),
        actual_meta: half_meta(twin.actual.as_ref()),
        expected_version: twin.expected_version.as_ref().and_then(to_json),
        actual_version: twin.actual_version.as_ref().and_then(to_json),
        optional: twin.optional.unwrap_or(true),
        attr_type: value_type.to_string(),
        metadata: if twin.is_tombstone() {
            None
        } else {
            Some(extra_json(twin.metadata.as_ref()))
        },
        ..DeviceTwinRow::default()
    }
}

pub fn twin_from_row(row: &DeviceTwinRow) -> MsgTwin {
    let half = |value: &Option<String>, meta: &Option<String>| {
        if value.is_none() && meta.is_none() {
            None
        } else {
            Some(TwinValue {
                value: value.clone(),
                metadata: from_json(meta.as_deref()),
            })
        }
    };
    MsgTwin {
        expected: half(&row.expected, &row.expected_meta),
        actual: half(&row.actual, &row.actual_meta),
        optional: Some(row.optional),
        metadata: Some(type_metadata(&row.attr_type, row.metadata.as_deref())),
        expected_version: from_json(row.expected_version.as_deref()),
        actual_version: from_json(row.actual_version.as_deref()),
    }
}

pub fn attr_columns(old: &DeviceAttrRow, new: &DeviceAttrRow) -> ColumnSet<AttrColumn> {
    let mut cols = ColumnSet::new();
    if old.value != new.value {
        cols.insert(AttrColumn::Value, ColumnValue::text(&new.value));
    }
    if old.optional != new.optional {
        cols.insert(AttrColumn::Optional, ColumnValue::Bool(new.optional));
    }
    if old.attr_type != new.attr_type {
        cols.insert(AttrColumn::AttrType, ColumnValue::text(&new.attr_type));
    }
    if old.metadata != new.metadata {
        cols.insert(AttrColumn::Metadata, ColumnValue::text(&new.metadata));
    }
    cols
}

pub fn twin_columns(old: &DeviceTwinRow, new: &DeviceTwinRow) -> ColumnSet<TwinColumn> {
    let mut cols = ColumnSet::new();
    let nullable = [
        (TwinColumn::Expected, &old.expected, &new.expected),
        (TwinColumn::Actual, &old.actual, &new.actual),
        (TwinColumn::ExpectedMeta, &old.expected_meta, &new.expected_meta),
        (TwinColumn::ActualMeta, &old.actual_meta, &new.actual_meta),
        (
            TwinColumn::ExpectedVersion,
            &old.expected_version,
            &new.expected_version,
        ),
        (
            TwinColumn::ActualVersion,
            &old.actual_version,
            &new.actual_version,
        ),
        (TwinColumn::Metadata, &old.metadata, &new.metadata),
    ];
    for (column, before, after) in nullable {
        if before != after {
            cols.insert(column, ColumnValue::nullable(after.clone()));
        }
    }
    if old.optional != new.optional {
        cols.insert(TwinColumn::Optional, ColumnValue::Bool(new.optional));
    }
    if old.attr_type != new.attr_type {
        cols.insert(TwinColumn::AttrType, ColumnValue::text(&new.attr_type));
    }
    cols
}

/// 从三张表装配单个设备快照；设备行不存在时返回 `None`。
pub async fn load_device(
    store: &dyn TwinStore,
    device_id: &str,
) -> Result<Option<DeviceSnapshot>, EngineError> {
    let Some(row) = store
        .query_device(DeviceColumn::Id, device_id)
        .await?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };
    snapshot_from_rows(store, row).await.map(Some)
}

async fn snapshot_from_rows(
    store: &dyn TwinStore,
    row: DeviceRow,
) -> Result<DeviceSnapshot, EngineError> {
    let attributes = store
        .query_device_attr(&row.id)
        .await?
        .iter()
        .map(|attr| (attr.name.clone(), attr_from_row(attr)))
        .collect();
    let twin = store
        .query_device_twin(&row.id)
        .await?
        .iter()
        .map(|twin| (twin.name.clone(), twin_from_row(twin)))
        .collect();
    Ok(DeviceSnapshot {
        id: row.id,
        name: row.name,
        description: row.description,
        state: row.state,
        last_online: row.last_online,
        attributes,
        twin,
    })
}

/// 以库中数据覆盖内存快照；库中已无该设备时一并移除内存条目。
pub async fn sync_device_from_store(
    ctx: &TwinContext,
    device_id: &str,
) -> Result<(), EngineError> {
    match load_device(ctx.store().as_ref(), device_id).await? {
        Some(device) => ctx.put_device(device),
        None => {
            ctx.remove_device(device_id);
        }
    }
    Ok(())
}

/// 启动时恢复全部设备；返回设备数。
pub async fn sync_all_from_store(ctx: &TwinContext) -> Result<usize, EngineError> {
    let store = ctx.store().as_ref();
    let rows = store.query_device_all().await?;
    let count = rows.len();
    for row in rows {
        let device = snapshot_from_rows(store, row).await?;
        ctx.put_device(device);
    }
    info!(target: "twin.engine", devices = count, "devices_restored_from_store");
    Ok(count)
}

/// Worker 被中断后以库为准重建设备表：在全局写锁内覆盖全部快照，
/// 库中已不存在的设备连同设备锁一并移除。
pub async fn resync_all_from_store(ctx: &TwinContext) -> Result<usize, EngineError> {
    let _all = ctx.lock_all().await;
    let store = ctx.store().as_ref();
    let rows = store.query_device_all().await?;
    let persisted: BTreeSet<String> = rows.iter().map(|row| row.id.clone()).collect();
    let count = rows.len();
    for row in rows {
        let device = snapshot_from_rows(store, row).await?;
        ctx.put_device(device);
    }
    let mut dropped = 0usize;
    for id in ctx.device_ids() {
        if !persisted.contains(&id) {
            ctx.remove_device(&id);
            dropped += 1;
        }
    }
    info!(target: "twin.engine", devices = count, dropped, "devices_resynced_from_store");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::TwinVersion;
    use domain::twin::TYPE_DELETED;

    fn twin(expected: &str, version: TwinVersion) -> MsgTwin {
        MsgTwin {
            expected: Some(TwinValue::new(expected, 7)),
            expected_version: Some(version),
            metadata: Some(TypeMetadata::of_type("int")),
            ..MsgTwin::default()
        }
    }

    #[test]
    fn twin_row_roundtrip_keeps_halves_and_versions() {
        let row = twin_row("d1", "t", &twin("20", TwinVersion::new(1, 1)));
        assert_eq!(row.expected.as_deref(), Some("20"));
        assert_eq!(row.attr_type, "int");
        assert!(row.optional);
        let back = twin_from_row(&row);
        assert_eq!(back.expected_value(), Some("20"));
        assert_eq!(back.expected_version, Some(TwinVersion::new(1, 1)));
        assert!(back.actual.is_none());
    }

    #[test]
    fn tombstone_row_nulls_metadata() {
        let tombstone = MsgTwin {
            expected_version: Some(TwinVersion::new(2, 3)),
            metadata: Some(TypeMetadata::of_type(TYPE_DELETED)),
            ..MsgTwin::default()
        };
        let row = twin_row("d1", "t", &tombstone);
        assert_eq!(row.attr_type, TYPE_DELETED);
        assert!(row.metadata.is_none());
        assert!(row.expected.is_none());
        assert!(row.expected_version.is_some());
    }

    #[test]
    fn column_diff_lists_only_changed_columns() {
        let old = twin_row("d1", "t", &twin("20", TwinVersion::new(1, 1)));
        let new = twin_row("d1", "t", &twin("25", TwinVersion::new(2, 1)));
        let cols = twin_columns(&old, &new);
        let names: Vec<_> = cols.keys().copied().collect();
        assert_eq!(
            names,
            vec![TwinColumn::Expected, TwinColumn::ExpectedVersion]
        );
        assert!(twin_columns(&old, &old).is_empty());
    }

    #[test]
    fn attr_diff_tracks_optional_and_type() {
        let old = attr_row("d1", "a", &MsgAttr::default());
        let new = attr_row(
            "d1",
            "a",
            &MsgAttr {
                value: "x".to_string(),
                optional: Some(false),
                metadata: Some(TypeMetadata::of_type("int")),
            },
        );
        let cols = attr_columns(&old, &new);
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[&AttrColumn::Optional], ColumnValue::Bool(false));
    }
}
