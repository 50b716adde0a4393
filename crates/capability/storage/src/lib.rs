//! # Twin Storage 模块
//!
//! 边缘节点本地持久化：四张表，单个 SQLite 数据库。
//!
//! | 表 | 主键 | 内容 |
//! |---|---|---|
//! | `device` | `id` | 设备基本信息与状态 |
//! | `device_attr` | 自增 `id`，逻辑键 `(deviceid, name)` | 设备属性 |
//! | `device_twin` | 自增 `id`，逻辑键 `(deviceid, name)` | 孪生期望值 / 实际值 / 版本 |
//! | `meta` | `key` | DMI 映射器、设备、模型缓存 |
//!
//! ## 模块说明
//!
//! - [`models`]：行结构与列枚举
//! - [`traits`]：存储接口（`DeviceStore`、`DeviceAttrStore`、`DeviceTwinStore`、`MetaStore`）
//! - [`error`]：`StoreError`
//! - [`connection`]：连接池与建表
//! - [`sqlite`]：SQLite 实现
//!
//! ## 设计约束
//!
//! - 批事务（`add_device_trans`、`delete_device_trans`、`device_attr_trans`、
//!   `device_twin_trans`）全有或全无
//! - 删除设备时同时删除其属性与孪生行
//! - 列级更新只接受列枚举，所有取值参数化绑定

pub mod connection;
pub mod error;
pub mod models;
pub mod sqlite;
pub mod traits;

pub use connection::*;
pub use error::*;
pub use models::*;
pub use sqlite::SqliteStore;
pub use traits::*;
