use super::{SqliteStore, text_or_default};
use crate::error::StoreError;
use crate::models::{Column, MetaColumn, MetaRow};
use crate::traits::MetaStore;
use sqlx::Row;

#[async_trait::async_trait]
impl MetaStore for SqliteStore {
    async fn save_meta(&self, meta: &MetaRow) -> Result<(), StoreError> {
        sqlx::query("insert into meta (key, type, value) values (?, ?, ?)")
            .bind(&meta.key)
            .bind(&meta.meta_type)
            .bind(&meta.value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_or_update_meta(&self, meta: &MetaRow) -> Result<(), StoreError> {
        sqlx::query(
            "insert into meta (key, type, value) values (?, ?, ?) \
             on conflict(key) do update set type = excluded.type, value = excluded.value",
        )
        .bind(&meta.key)
        .bind(&meta.meta_type)
        .bind(&meta.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_meta(&self, key: MetaColumn, cond: &str) -> Result<Vec<MetaRow>, StoreError> {
        let sql = format!(
            "select key, type, value from meta where {} = ? order by key",
            key.name()
        );
        let rows = sqlx::query(&sql).bind(cond).fetch_all(&self.pool).await?;
        let mut metas = Vec::with_capacity(rows.len());
        for row in rows {
            metas.push(MetaRow {
                key: row.try_get("key")?,
                meta_type: text_or_default(row.try_get("type")?),
                value: text_or_default(row.try_get("value")?),
            });
        }
        Ok(metas)
    }

    async fn delete_meta_by_key(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("delete from meta where key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
