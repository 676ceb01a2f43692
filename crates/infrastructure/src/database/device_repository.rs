use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::error::{IngestError, Result};
use domain::registry::{DeviceMapping, DeviceRepository, RegisterOutcome, RegistryStats};
use sqlx::postgres::PgPool;
use sqlx::Row as SqlxRow;

fn db_err(e: sqlx::Error) -> IngestError {
    IngestError::Insert(e.to_string())
}

fn row_to_mapping(row: sqlx::postgres::PgRow) -> Result<DeviceMapping> {
    Ok(DeviceMapping {
        topic: row.try_get("topic").map_err(db_err)?,
        device_id: row.try_get("device_id").map_err(db_err)?,
        table_name: row.try_get("table_name").map_err(db_err)?,
        pattern_name: row.try_get("pattern_name").map_err(db_err)?,
        device_name: row.try_get("device_name").map_err(db_err)?,
        first_seen: row.try_get::<DateTime<Utc>, _>("first_seen").map_err(db_err)?,
        last_seen: row.try_get::<DateTime<Utc>, _>("last_seen").map_err(db_err)?,
        message_count: row.try_get::<i64, _>("message_count").map_err(db_err)? as u64,
    })
}

/// [`DeviceRepository`] backed by the `device_mapper` table created by the
/// migration crate. Unlike the schema-manager tables, its columns are fixed
/// up front, so this uses ordinary static SQL.
pub struct PostgresDeviceRepository {
    pool: PgPool,
}

impl PostgresDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    async fn register(
        &self,
        topic: &str,
        device_id: &str,
        table_name: &str,
        pattern_name: &str,
        device_name: Option<&str>,
    ) -> Result<RegisterOutcome> {
        let existing = sqlx::query("SELECT 1 FROM device_mapper WHERE topic = $1 AND device_id = $2")
            .bind(topic)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let outcome = if existing.is_some() { RegisterOutcome::Updated } else { RegisterOutcome::New };

        sqlx::query(
            "INSERT INTO device_mapper \
                (topic, device_id, table_name, pattern_name, device_name, first_seen, last_seen, message_count) \
             VALUES ($1, $2, $3, $4, $5, now(), now(), 1) \
             ON CONFLICT (topic, device_id) DO UPDATE SET \
                table_name = EXCLUDED.table_name, \
                pattern_name = EXCLUDED.pattern_name, \
                device_name = COALESCE(EXCLUDED.device_name, device_mapper.device_name), \
                last_seen = now(), \
                message_count = device_mapper.message_count + 1",
        )
        .bind(topic)
        .bind(device_id)
        .bind(table_name)
        .bind(pattern_name)
        .bind(device_name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(outcome)
    }

    async fn find(&self, topic: &str, device_id: &str) -> Result<Option<DeviceMapping>> {
        let row = sqlx::query("SELECT * FROM device_mapper WHERE topic = $1 AND device_id = $2")
            .bind(topic)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(row_to_mapping).transpose()
    }

    async fn find_by_topic(&self, topic: &str) -> Result<Vec<DeviceMapping>> {
        let rows = sqlx::query("SELECT * FROM device_mapper WHERE topic = $1 ORDER BY device_id")
            .bind(topic)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(row_to_mapping).collect()
    }

    async fn find_by_table(&self, table_name: &str) -> Result<Vec<DeviceMapping>> {
        let rows = sqlx::query("SELECT * FROM device_mapper WHERE table_name = $1 ORDER BY topic, device_id")
            .bind(table_name)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(row_to_mapping).collect()
    }

    async fn list_all(&self) -> Result<Vec<DeviceMapping>> {
        let rows = sqlx::query("SELECT * FROM device_mapper ORDER BY topic, device_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(row_to_mapping).collect()
    }

    async fn set_name(&self, topic: &str, device_id: &str, device_name: &str) -> Result<()> {
        sqlx::query("UPDATE device_mapper SET device_name = $1 WHERE topic = $2 AND device_id = $3")
            .bind(device_name)
            .bind(topic)
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn stats(&self) -> Result<RegistryStats> {
        let row = sqlx::query("SELECT count(*) AS total, count(device_name) AS named FROM device_mapper")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let total: i64 = row.try_get("total").map_err(db_err)?;
        let named: i64 = row.try_get("named").map_err(db_err)?;

        let topic_rows = sqlx::query("SELECT topic, count(*) AS n FROM device_mapper GROUP BY topic")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut per_topic = std::collections::BTreeMap::new();
        for row in topic_rows {
            let topic: String = row.try_get("topic").map_err(db_err)?;
            let n: i64 = row.try_get("n").map_err(db_err)?;
            per_topic.insert(topic, n as u64);
        }

        let table_rows = sqlx::query("SELECT table_name, count(*) AS n FROM device_mapper GROUP BY table_name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut per_table = std::collections::BTreeMap::new();
        for row in table_rows {
            let table_name: String = row.try_get("table_name").map_err(db_err)?;
            let n: i64 = row.try_get("n").map_err(db_err)?;
            per_table.insert(table_name, n as u64);
        }

        Ok(RegistryStats {
            total: total as u64,
            named: named as u64,
            unnamed: (total - named) as u64,
            per_topic,
            per_table,
        })
    }
}
