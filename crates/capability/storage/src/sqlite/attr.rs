use super::{SqliteStore, text_or_default, update_columns};
use crate::error::StoreError;
use crate::models::{AttrColumn, AttrUpdate, ColumnSet, ColumnValue, DeviceAttrRow, RowDelete};
use crate::traits::DeviceAttrStore;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqliteRow};

const SELECT_ATTR: &str = "select id, deviceid, name, description, value, optional, attr_type, \
                           metadata from device_attr";

pub(super) async fn insert_attr(
    conn: &mut SqliteConnection,
    attr: &DeviceAttrRow,
) -> Result<(), StoreError> {
    sqlx::query(
        "insert into device_attr \
         (deviceid, name, description, value, optional, attr_type, metadata) \
         values (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&attr.device_id)
    .bind(&attr.name)
    .bind(&attr.description)
    .bind(&attr.value)
    .bind(attr.optional)
    .bind(&attr.attr_type)
    .bind(&attr.metadata)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_attr(
    conn: &mut SqliteConnection,
    device_id: &str,
    name: &str,
) -> Result<(), StoreError> {
    sqlx::query("delete from device_attr where deviceid = ? and name = ?")
        .bind(device_id)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn attr_from_row(row: &SqliteRow) -> Result<DeviceAttrRow, StoreError> {
    Ok(DeviceAttrRow {
        id: row.try_get("id")?,
        device_id: row.try_get("deviceid")?,
        name: row.try_get("name")?,
        description: text_or_default(row.try_get("description")?),
        value: text_or_default(row.try_get("value")?),
        optional: row.try_get::<Option<bool>, _>("optional")?.unwrap_or(false),
        attr_type: text_or_default(row.try_get("attr_type")?),
        metadata: text_or_default(row.try_get("metadata")?),
    })
}

#[async_trait::async_trait]
impl DeviceAttrStore for SqliteStore {
    async fn save_device_attr(&self, attr: &DeviceAttrRow) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_attr(&mut conn, attr).await
    }

    async fn delete_device_attr_by_id(&self, device_id: &str) -> Result<(), StoreError> {
        sqlx::query("delete from device_attr where deviceid = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_device_attr(&self, device_id: &str, name: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        delete_attr(&mut conn, device_id, name).await
    }

    async fn update_device_attr_field(
        &self,
        device_id: &str,
        name: &str,
        column: AttrColumn,
        value: ColumnValue,
    ) -> Result<(), StoreError> {
        let mut cols = ColumnSet::new();
        cols.insert(column, value);
        self.update_device_attr_fields(device_id, name, &cols).await
    }

    async fn update_device_attr_fields(
        &self,
        device_id: &str,
        name: &str,
        cols: &ColumnSet<AttrColumn>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_columns(
            &mut conn,
            "device_attr",
            cols,
            "deviceid = ? and name = ?",
            &[device_id, name],
        )
        .await
    }

    async fn query_device_attr(&self, device_id: &str) -> Result<Vec<DeviceAttrRow>, StoreError> {
        let sql = format!("{SELECT_ATTR} where deviceid = ? order by id");
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attr_from_row).collect()
    }

    async fn query_device_attr_by_name(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<Vec<DeviceAttrRow>, StoreError> {
        let sql = format!("{SELECT_ATTR} where deviceid = ? and name = ?");
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attr_from_row).collect()
    }

    async fn device_attr_trans(
        &self,
        adds: &[DeviceAttrRow],
        deletes: &[RowDelete],
        updates: &[AttrUpdate],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in adds {
            insert_attr(&mut tx, row).await?;
        }
        for row in deletes {
            delete_attr(&mut tx, &row.device_id, &row.name).await?;
        }
        for update in updates {
            update_columns(
                &mut tx,
                "device_attr",
                &update.cols,
                "deviceid = ? and name = ?",
                &[update.device_id.as_str(), update.name.as_str()],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
