use super::{SqliteStore, text_or_default, update_columns};
use crate::error::StoreError;
use crate::models::{ColumnSet, ColumnValue, DeviceTwinRow, RowDelete, TwinColumn, TwinUpdate};
use crate::traits::DeviceTwinStore;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqliteRow};

const SELECT_TWIN: &str = "select id, deviceid, name, description, expected, actual, \
                           expected_meta, actual_meta, expected_version, actual_version, \
                           optional, attr_type, metadata from device_twin";

pub(super) async fn insert_twin(
    conn: &mut SqliteConnection,
    twin: &DeviceTwinRow,
) -> Result<(), StoreError> {
    sqlx::query(
        "insert into device_twin \
         (deviceid, name, description, expected, actual, expected_meta, actual_meta, \
          expected_version, actual_version, optional, attr_type, metadata) \
         values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&twin.device_id)
    .bind(&twin.name)
    .bind(&twin.description)
    .bind(&twin.expected)
    .bind(&twin.actual)
    .bind(&twin.expected_meta)
    .bind(&twin.actual_meta)
    .bind(&twin.expected_version)
    .bind(&twin.actual_version)
    .bind(twin.optional)
    .bind(&twin.attr_type)
    .bind(&twin.metadata)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_twin(
    conn: &mut SqliteConnection,
    device_id: &str,
    name: &str,
) -> Result<(), StoreError> {
    sqlx::query("delete from device_twin where deviceid = ? and name = ?")
        .bind(device_id)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn twin_from_row(row: &SqliteRow) -> Result<DeviceTwinRow, StoreError> {
    Ok(DeviceTwinRow {
        id: row.try_get("id")?,
        device_id: row.try_get("deviceid")?,
        name: row.try_get("name")?,
        description: text_or_default(row.try_get("description")?),
        expected: row.try_get("expected")?,
        actual: row.try_get("actual")?,
        expected_meta: row.try_get("expected_meta")?,
        actual_meta: row.try_get("actual_meta")?,
        expected_version: row.try_get("expected_version")?,
        actual_version: row.try_get("actual_version")?,
        optional: row.try_get::<Option<bool>, _>("optional")?.unwrap_or(true),
        attr_type: text_or_default(row.try_get("attr_type")?),
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait::async_trait]
impl DeviceTwinStore for SqliteStore {
    async fn save_device_twin(&self, twin: &DeviceTwinRow) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_twin(&mut conn, twin).await
    }

    async fn delete_device_twin_by_id(&self, device_id: &str) -> Result<(), StoreError> {
        sqlx::query("delete from device_twin where deviceid = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_device_twin(&self, device_id: &str, name: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        delete_twin(&mut conn, device_id, name).await
    }

    async fn update_device_twin_field(
        &self,
        device_id: &str,
        name: &str,
        column: TwinColumn,
        value: ColumnValue,
    ) -> Result<(), StoreError> {
        let mut cols = ColumnSet::new();
        cols.insert(column, value);
        self.update_device_twin_fields(device_id, name, &cols).await
    }

    async fn update_device_twin_fields(
        &self,
        device_id: &str,
        name: &str,
        cols: &ColumnSet<TwinColumn>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_columns(
            &mut conn,
            "device_twin",
            cols,
            "deviceid = ? and name = ?",
            &[device_id, name],
        )
        .await
    }

    async fn query_device_twin(&self, device_id: &str) -> Result<Vec<DeviceTwinRow>, StoreError> {
        let sql = format!("{SELECT_TWIN} where deviceid = ? order by id");
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(twin_from_row).collect()
    }

    async fn query_device_twin_by_name(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<Vec<DeviceTwinRow>, StoreError> {
        let sql = format!("{SELECT_TWIN} where deviceid = ? and name = ?");
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(twin_from_row).collect()
    }

    async fn device_twin_trans(
        &self,
        adds: &[DeviceTwinRow],
        deletes: &[RowDelete],
        updates: &[TwinUpdate],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in adds {
            insert_twin(&mut tx, row).await?;
        }
        for row in deletes {
            delete_twin(&mut tx, &row.device_id, &row.name).await?;
        }
        for update in updates {
            update_columns(
                &mut tx,
                "device_twin",
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
