//! SQLite 存储实现
//!
//! 单个 `SqliteStore` 同时实现四个存储接口。批事务在一个事务内执行，
//! 任一语句失败时事务随 `?` 提前返回被丢弃，sqlx 自动回滚。

mod attr;
mod device;
mod meta;
mod twin;

use crate::connection::{connect_pool, init_schema, memory_pool};
use crate::error::StoreError;
use crate::models::{Column, ColumnSet, ColumnValue};
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::{Sqlite, SqlitePool};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Clone)]
pub struct SqliteStore {
    pub pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 打开（或创建）数据库文件并建表。
    pub async fn connect(source: &str) -> Result<Self, StoreError> {
        let pool = connect_pool(source).await?;
        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// 内存库并建表。
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = memory_pool().await?;
        init_schema(&pool).await?;
        Ok(Self { pool })
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &ColumnValue) -> SqliteQuery<'q> {
    match value {
        ColumnValue::Text(text) => query.bind(text.clone()),
        ColumnValue::Bool(flag) => query.bind(*flag),
        ColumnValue::Null => query.bind(None::<String>),
    }
}

/// `update <table> set a = ?, b = ? where <filter>`，列值先于过滤参数绑定。
async fn update_columns<C: Column>(
    conn: &mut SqliteConnection,
    table: &str,
    cols: &ColumnSet<C>,
    filter: &str,
    filter_args: &[&str],
) -> Result<(), StoreError> {
    if cols.is_empty() {
        return Ok(());
    }
    let sets: Vec<String> = cols
        .keys()
        .map(|column| format!("{} = ?", column.name()))
        .collect();
    let sql = format!("update {table} set {} where {filter}", sets.join(", "));
    let mut query = sqlx::query(&sql);
    for value in cols.values() {
        query = bind_value(query, value);
    }
    for arg in filter_args {
        query = query.bind(arg.to_string());
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

fn text_or_default(value: Option<String>) -> String {
    value.unwrap_or_default()
}
