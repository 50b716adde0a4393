//! 数据库连接管理
//!
//! 提供 SQLite 连接池初始化与建表：
//! - connect_pool：按数据源路径建立连接池（文件不存在时创建）
//! - memory_pool：单连接内存库（测试用）
//! - init_schema：幂等建表
//!
//! 内存库的数据只存在于单个连接上，因此内存池固定 1 个连接且不回收。

use crate::error::StoreError;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

const SCHEMA: [&str; 4] = [
    "create table if not exists device (\
        id text primary key not null, \
        name text, \
        description text, \
        state text, \
        last_online text)",
    "create table if not exists device_attr (\
        id integer primary key autoincrement, \
        deviceid text not null, \
        name text not null, \
        description text, \
        value text, \
        optional integer, \
        attr_type text, \
        metadata text)",
    "create table if not exists device_twin (\
        id integer primary key autoincrement, \
        deviceid text not null, \
        name text not null, \
        description text, \
        expected text, \
        actual text, \
        expected_meta text, \
        actual_meta text, \
        expected_version text, \
        actual_version text, \
        optional integer, \
        attr_type text, \
        metadata text)",
    "create table if not exists meta (\
        key text primary key not null, \
        type text, \
        value text)",
];

/// 建立 SQLite 连接池
///
/// `source` 为文件路径或 `sqlite:` 开头的完整连接串。
pub async fn connect_pool(source: &str) -> Result<SqlitePool, StoreError> {
    if source.is_empty() {
        return Err(StoreError::Config("empty db source".to_string()));
    }
    let url = if source.starts_with("sqlite:") {
        source.to_string()
    } else {
        format!("sqlite:{source}?mode=rwc")
    };
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;
    Ok(pool)
}

/// 单连接内存库。
pub async fn memory_pool() -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

/// 幂等建表。
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
