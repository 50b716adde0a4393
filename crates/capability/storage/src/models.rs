//! 数据模型
//!
//! 四张表的行结构，以及列级更新使用的列枚举：
//! - 设备：DeviceRow / DeviceColumn
//! - 属性：DeviceAttrRow / AttrColumn
//! - 孪生：DeviceTwinRow / TwinColumn
//! - 元数据：MetaRow / MetaColumn
//!
//! 列名只来自枚举，动态 SQL 中不会出现调用方提供的标识符。

use std::collections::BTreeMap;

/// 可出现在动态 SQL 中的列。
pub trait Column: Copy + Ord + Send + Sync {
    fn name(self) -> &'static str;
}

/// 列值。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Text(String),
    Bool(bool),
    Null,
}

impl ColumnValue {
    pub fn text(value: impl Into<String>) -> Self {
        ColumnValue::Text(value.into())
    }

    /// `None` 写为 NULL。
    pub fn nullable(value: Option<String>) -> Self {
        match value {
            Some(value) => ColumnValue::Text(value),
            None => ColumnValue::Null,
        }
    }
}

/// 有序的列更新集合。
pub type ColumnSet<C> = BTreeMap<C, ColumnValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceColumn {
    Id,
    Name,
    Description,
    State,
    LastOnline,
}

impl Column for DeviceColumn {
    fn name(self) -> &'static str {
        match self {
            DeviceColumn::Id => "id",
            DeviceColumn::Name => "name",
            DeviceColumn::Description => "description",
            DeviceColumn::State => "state",
            DeviceColumn::LastOnline => "last_online",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttrColumn {
    Description,
    Value,
    Optional,
    AttrType,
    Metadata,
}

impl Column for AttrColumn {
    fn name(self) -> &'static str {
        match self {
            AttrColumn::Description => "description",
            AttrColumn::Value => "value",
            AttrColumn::Optional => "optional",
            AttrColumn::AttrType => "attr_type",
            AttrColumn::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TwinColumn {
    Description,
    Expected,
    Actual,
    ExpectedMeta,
    ActualMeta,
    ExpectedVersion,
    ActualVersion,
    Optional,
    AttrType,
    Metadata,
}

impl Column for TwinColumn {
    fn name(self) -> &'static str {
        match self {
            TwinColumn::Description => "description",
            TwinColumn::Expected => "expected",
            TwinColumn::Actual => "actual",
            TwinColumn::ExpectedMeta => "expected_meta",
            TwinColumn::ActualMeta => "actual_meta",
            TwinColumn::ExpectedVersion => "expected_version",
            TwinColumn::ActualVersion => "actual_version",
            TwinColumn::Optional => "optional",
            TwinColumn::AttrType => "attr_type",
            TwinColumn::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetaColumn {
    Key,
    Type,
}

impl Column for MetaColumn {
    fn name(self) -> &'static str {
        match self {
            MetaColumn::Key => "key",
            MetaColumn::Type => "type",
        }
    }
}

/// 设备行。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub state: String,
    pub last_online: String,
}

/// 属性行；`id` 由库自增，插入时忽略。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAttrRow {
    pub id: i64,
    pub device_id: String,
    pub name: String,
    pub description: String,
    pub value: String,
    pub optional: bool,
    pub attr_type: String,
    pub metadata: String,
}

/// 孪生行；版本与取值元数据以 JSON 文本保存。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTwinRow {
    pub id: i64,
    pub device_id: String,
    pub name: String,
    pub description: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub expected_meta: Option<String>,
    pub actual_meta: Option<String>,
    pub expected_version: Option<String>,
    pub actual_version: Option<String>,
    pub optional: bool,
    pub attr_type: String,
    pub metadata: Option<String>,
}

/// 元数据行（DMI 缓存持久化）。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaRow {
    pub key: String,
    pub meta_type: String,
    pub value: String,
}

/// 按 `(device_id, name)` 删除。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDelete {
    pub device_id: String,
    pub name: String,
}

/// 按 `(device_id, name)` 列级更新。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate<C: Column> {
    pub device_id: String,
    pub name: String,
    pub cols: ColumnSet<C>,
}

pub type AttrUpdate = RowUpdate<AttrColumn>;
pub type TwinUpdate = RowUpdate<TwinColumn>;
