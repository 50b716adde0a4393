#![allow(dead_code)]

use async_trait::async_trait;
use domain::{Action, Device, MsgTwin, TwinValue, TwinVersion, TypeMetadata, WorkerKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use twin_engine::reconcile::add_devices;
use twin_engine::{DtMessage, RetryPolicy, TwinContext};
use twin_storage::{
    AttrColumn, AttrUpdate, ColumnSet, ColumnValue, DeviceAttrRow, DeviceAttrStore, DeviceColumn,
    DeviceRow, DeviceStore, DeviceTwinRow, DeviceTwinStore, MetaColumn, MetaRow, MetaStore,
    RowDelete, SqliteStore, StoreError, TwinColumn, TwinStore, TwinUpdate,
};

pub const NODE: &str = "edge-1";

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(10))
}

pub async fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().await.expect("memory store"))
}

pub fn context_with(store: Arc<dyn TwinStore>) -> Arc<TwinContext> {
    Arc::new(TwinContext::new(
        NODE,
        store,
        fast_retry(),
        CancellationToken::new(),
    ))
}

pub async fn context() -> (Arc<TwinContext>, Arc<SqliteStore>) {
    let store = memory_store().await;
    (context_with(store.clone()), store)
}

pub fn string_twin(expected: Option<&str>, actual: Option<&str>, version: TwinVersion) -> MsgTwin {
    MsgTwin {
        expected: expected.map(|value| TwinValue::new(value, 1)),
        actual: actual.map(|value| TwinValue::new(value, 1)),
        optional: Some(true),
        metadata: Some(TypeMetadata::of_type("string")),
        expected_version: expected.map(|_| version),
        actual_version: actual.map(|_| version),
    }
}

pub fn device(id: &str, twins: &[(&str, MsgTwin)]) -> Device {
    Device {
        id: id.to_string(),
        name: format!("{id}-name"),
        state: "unknown".to_string(),
        twin: twins
            .iter()
            .map(|(name, twin)| (name.to_string(), Some(twin.clone())))
            .collect(),
        ..Device::default()
    }
}

/// 预置设备，并清空预置过程产生的出站消息。
pub async fn seed(ctx: &TwinContext, devices: &[Device]) {
    add_devices(ctx, devices, false, "seed").await.expect("seed devices");
    drain(ctx, WorkerKind::Comm).await;
}

pub fn twins(entries: &[(&str, Option<MsgTwin>)]) -> BTreeMap<String, Option<MsgTwin>> {
    entries
        .iter()
        .map(|(name, twin)| (name.to_string(), twin.clone()))
        .collect()
}

pub async fn drain(ctx: &TwinContext, kind: WorkerKind) -> Vec<DtMessage> {
    let receiver = ctx.receiver(kind);
    let mut receiver = receiver.lock().await;
    let mut messages = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        messages.push(message);
    }
    messages
}

/// 出站消息：`(action, resource, JSON 载荷)`。
pub fn outbound(messages: &[DtMessage]) -> Vec<(Action, String, serde_json::Value)> {
    messages
        .iter()
        .map(|message| {
            let bytes = message.msg.content.to_bytes().expect("content bytes");
            let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (message.action, message.msg.resource().to_string(), value)
        })
        .collect()
}

pub fn find<'a>(
    messages: &'a [(Action, String, serde_json::Value)],
    resource: &str,
) -> Option<&'a serde_json::Value> {
    messages
        .iter()
        .find(|(_, candidate, _)| candidate == resource)
        .map(|(_, _, value)| value)
}

/// 可注入写失败的存储；读操作始终透传。
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for FlakyStore {
    async fn save_device(&self, device: &DeviceRow) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_device(device).await
    }

    async fn delete_device_by_id(&self, id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete_device_by_id(id).await
    }

    async fn update_device_field(
        &self,
        id: &str,
        column: DeviceColumn,
        value: ColumnValue,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.update_device_field(id, column, value).await
    }

    async fn update_device_fields(
        &self,
        id: &str,
        cols: &ColumnSet<DeviceColumn>,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.update_device_fields(id, cols).await
    }

    async fn query_device(
        &self,
        key: DeviceColumn,
        cond: &str,
    ) -> Result<Vec<DeviceRow>, StoreError> {
        self.inner.query_device(key, cond).await
    }

    async fn query_device_all(&self) -> Result<Vec<DeviceRow>, StoreError> {
        self.inner.query_device_all().await
    }

    async fn add_device_trans(
        &self,
        devices: &[DeviceRow],
        attrs: &[DeviceAttrRow],
        twins: &[DeviceTwinRow],
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.add_device_trans(devices, attrs, twins).await
    }

    async fn delete_device_trans(&self, ids: &[String]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete_device_trans(ids).await
    }
}

#[async_trait]
impl DeviceAttrStore for FlakyStore {
    async fn save_device_attr(&self, attr: &DeviceAttrRow) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_device_attr(attr).await
    }

    async fn delete_device_attr_by_id(&self, device_id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete_device_attr_by_id(device_id).await
    }

    async fn delete_device_attr(&self, device_id: &str, name: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete_device_attr(device_id, name).await
    }

    async fn update_device_attr_field(
        &self,
        device_id: &str,
        name: &str,
        column: AttrColumn,
        value: ColumnValue,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .update_device_attr_field(device_id, name, column, value)
            .await
    }

    async fn update_device_attr_fields(
        &self,
        device_id: &str,
        name: &str,
        cols: &ColumnSet<AttrColumn>,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.update_device_attr_fields(device_id, name, cols).await
    }

    async fn query_device_attr(&self, device_id: &str) -> Result<Vec<DeviceAttrRow>, StoreError> {
        self.inner.query_device_attr(device_id).await
    }

    async fn query_device_attr_by_name(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<Vec<DeviceAttrRow>, StoreError> {
        self.inner.query_device_attr_by_name(device_id, name).await
    }

    async fn device_attr_trans(
        &self,
        adds: &[DeviceAttrRow],
        deletes: &[RowDelete],
        updates: &[AttrUpdate],
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.device_attr_trans(adds, deletes, updates).await
    }
}

#[async_trait]
impl DeviceTwinStore for FlakyStore {
    async fn save_device_twin(&self, twin: &DeviceTwinRow) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_device_twin(twin).await
    }

    async fn delete_device_twin_by_id(&self, device_id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete_device_twin_by_id(device_id).await
    }

    async fn delete_device_twin(&self, device_id: &str, name: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete_device_twin(device_id, name).await
    }

    async fn update_device_twin_field(
        &self,
        device_id: &str,
        name: &str,
        column: TwinColumn,
        value: ColumnValue,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .update_device_twin_field(device_id, name, column, value)
            .await
    }

    async fn update_device_twin_fields(
        &self,
        device_id: &str,
        name: &str,
        cols: &ColumnSet<TwinColumn>,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.update_device_twin_fields(device_id, name, cols).await
    }

    async fn query_device_twin(&self, device_id: &str) -> Result<Vec<DeviceTwinRow>, StoreError> {
        self.inner.query_device_twin(device_id).await
    }

    async fn query_device_twin_by_name(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<Vec<DeviceTwinRow>, StoreError> {
        self.inner.query_device_twin_by_name(device_id, name).await
    }

    async fn device_twin_trans(
        &self,
        adds: &[DeviceTwinRow],
        deletes: &[RowDelete],
        updates: &[TwinUpdate],
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.device_twin_trans(adds, deletes, updates).await
    }
}

#[async_trait]
impl MetaStore for FlakyStore {
    async fn save_meta(&self, meta: &MetaRow) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_meta(meta).await
    }

    async fn insert_or_update_meta(&self, meta: &MetaRow) -> Result<(), StoreError> {
        self.check()?;
        self.inner.insert_or_update_meta(meta).await
    }

    async fn query_meta(&self, key: MetaColumn, cond: &str) -> Result<Vec<MetaRow>, StoreError> {
        self.inner.query_meta(key, cond).await
    }

    async fn delete_meta_by_key(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete_meta_by_key(key).await
    }
}
