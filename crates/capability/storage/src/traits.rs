//! 存储接口 Trait 定义
//!
//! - DeviceStore：设备表，含批量新增 / 删除事务
//! - DeviceAttrStore：属性表，含 add/delete/update 批事务
//! - DeviceTwinStore：孪生表，含 add/delete/update 批事务
//! - MetaStore：元数据表
//!
//! 所有批事务要么全部生效，要么全部回滚。

use crate::error::StoreError;
use crate::models::{
    AttrColumn, AttrUpdate, ColumnSet, ColumnValue, DeviceAttrRow, DeviceColumn, DeviceRow,
    DeviceTwinRow, MetaColumn, MetaRow, RowDelete, TwinColumn, TwinUpdate,
};
use async_trait::async_trait;

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn save_device(&self, device: &DeviceRow) -> Result<(), StoreError>;

    async fn delete_device_by_id(&self, id: &str) -> Result<(), StoreError>;

    async fn update_device_field(
        &self,
        id: &str,
        column: DeviceColumn,
        value: ColumnValue,
    ) -> Result<(), StoreError>;

    async fn update_device_fields(
        &self,
        id: &str,
        cols: &ColumnSet<DeviceColumn>,
    ) -> Result<(), StoreError>;

    async fn query_device(
        &self,
        key: DeviceColumn,
        cond: &str,
    ) -> Result<Vec<DeviceRow>, StoreError>;

    async fn query_device_all(&self) -> Result<Vec<DeviceRow>, StoreError>;

    /// 新增设备及其属性与孪生。
    async fn add_device_trans(
        &self,
        devices: &[DeviceRow],
        attrs: &[DeviceAttrRow],
        twins: &[DeviceTwinRow],
    ) -> Result<(), StoreError>;

    /// 删除设备及其全部属性与孪生。
    async fn delete_device_trans(&self, ids: &[String]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DeviceAttrStore: Send + Sync {
    async fn save_device_attr(&self, attr: &DeviceAttrRow) -> Result<(), StoreError>;

    async fn delete_device_attr_by_id(&self, device_id: &str) -> Result<(), StoreError>;

    async fn delete_device_attr(&self, device_id: &str, name: &str) -> Result<(), StoreError>;

    async fn update_device_attr_field(
        &self,
        device_id: &str,
        name: &str,
        column: AttrColumn,
        value: ColumnValue,
    ) -> Result<(), StoreError>;

    async fn update_device_attr_fields(
        &self,
        device_id: &str,
        name: &str,
        cols: &ColumnSet<AttrColumn>,
    ) -> Result<(), StoreError>;

    async fn query_device_attr(&self, device_id: &str) -> Result<Vec<DeviceAttrRow>, StoreError>;

    async fn query_device_attr_by_name(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<Vec<DeviceAttrRow>, StoreError>;

    async fn device_attr_trans(
        &self,
        adds: &[DeviceAttrRow],
        deletes: &[RowDelete],
        updates: &[AttrUpdate],
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DeviceTwinStore: Send + Sync {
    async fn save_device_twin(&self, twin: &DeviceTwinRow) -> Result<(), StoreError>;

    async fn delete_device_twin_by_id(&self, device_id: &str) -> Result<(), StoreError>;

    async fn delete_device_twin(&self, device_id: &str, name: &str) -> Result<(), StoreError>;

    async fn update_device_twin_field(
        &self,
        device_id: &str,
        name: &str,
        column: TwinColumn,
        value: ColumnValue,
    ) -> Result<(), StoreError>;

    async fn update_device_twin_fields(
        &self,
        device_id: &str,
        name: &str,
        cols: &ColumnSet<TwinColumn>,
    ) -> Result<(), StoreError>;

    async fn query_device_twin(&self, device_id: &str) -> Result<Vec<DeviceTwinRow>, StoreError>;

    async fn query_device_twin_by_name(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<Vec<DeviceTwinRow>, StoreError>;

    async fn device_twin_trans(
        &self,
        adds: &[DeviceTwinRow],
        deletes: &[RowDelete],
        updates: &[TwinUpdate],
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// 插入；主键冲突返回 `UniqueViolation`。
    async fn save_meta(&self, meta: &MetaRow) -> Result<(), StoreError>;

    async fn insert_or_update_meta(&self, meta: &MetaRow) -> Result<(), StoreError>;

    async fn query_meta(&self, key: MetaColumn, cond: &str) -> Result<Vec<MetaRow>, StoreError>;

    async fn delete_meta_by_key(&self, key: &str) -> Result<(), StoreError>;
}

/// 孪生引擎使用的完整存储接口。
pub trait TwinStore: DeviceStore + DeviceAttrStore + DeviceTwinStore + MetaStore {}

impl<T> TwinStore for T where T: DeviceStore + DeviceAttrStore + DeviceTwinStore + MetaStore {}
