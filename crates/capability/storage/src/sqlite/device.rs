use super::{SqliteStore, attr, text_or_default, twin, update_columns};
use crate::error::StoreError;
use crate::models::{
    Column, ColumnSet, ColumnValue, DeviceAttrRow, DeviceColumn, DeviceRow, DeviceTwinRow,
};
use crate::traits::DeviceStore;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqliteRow};

const SELECT_DEVICE: &str = "select id, name, description, state, last_online from device";

pub(super) async fn insert_device(
    conn: &mut SqliteConnection,
    device: &DeviceRow,
) -> Result<(), StoreError> {
    sqlx::query(
        "insert into device (id, name, description, state, last_online) \
         values (?, ?, ?, ?, ?)",
    )
    .bind(&device.id)
    .bind(&device.name)
    .bind(&device.description)
    .bind(&device.state)
    .bind(&device.last_online)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn device_from_row(row: &SqliteRow) -> Result<DeviceRow, StoreError> {
    Ok(DeviceRow {
        id: row.try_get("id")?,
        name: text_or_default(row.try_get("name")?),
        description: text_or_default(row.try_get("description")?),
        state: text_or_default(row.try_get("state")?),
        last_online: text_or_default(row.try_get("last_online")?),
    })
}

#[async_trait::async_trait]
impl DeviceStore for SqliteStore {
    async fn save_device(&self, device: &DeviceRow) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_device(&mut conn, device).await
    }

    async fn delete_device_by_id(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("delete from device where id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_device_field(
        &self,
        id: &str,
        column: DeviceColumn,
        value: ColumnValue,
    ) -> Result<(), StoreError> {
        let mut cols = ColumnSet::new();
        cols.insert(column, value);
        self.update_device_fields(id, &cols).await
    }

    async fn update_device_fields(
        &self,
        id: &str,
        cols: &ColumnSet<DeviceColumn>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_columns(&mut conn, "device", cols, "id = ?", &[id]).await
    }

    async fn query_device(
        &self,
        key: DeviceColumn,
        cond: &str,
    ) -> Result<Vec<DeviceRow>, StoreError> {
        let sql = format!("{SELECT_DEVICE} where {} = ?", key.name());
        let rows = sqlx::query(&sql).bind(cond).fetch_all(&self.pool).await?;
        rows.iter().map(device_from_row).collect()
    }

    async fn query_device_all(&self) -> Result<Vec<DeviceRow>, StoreError> {
        let rows = sqlx::query(SELECT_DEVICE).fetch_all(&self.pool).await?;
        rows.iter().map(device_from_row).collect()
    }

    async fn add_device_trans(
        &self,
        devices: &[DeviceRow],
        attrs: &[DeviceAttrRow],
        twins: &[DeviceTwinRow],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for device in devices {
            insert_device(&mut tx, device).await?;
        }
        for row in attrs {
            attr::insert_attr(&mut tx, row).await?;
        }
        for row in twins {
            twin::insert_twin(&mut tx, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_device_trans(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("delete from device where id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from device_attr where deviceid = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("delete from device_twin where deviceid = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
