use async_trait::async_trait;
use jiff::Timestamp;
use minerhq_core::{Block, BlockValue, Device, DeviceAddr, Share, Snapshot};
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqlitePoolOptions, sqlite::SqliteRow};

use crate::storage::Store;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// SQLite-backed store. Timestamps are stored as Unix milliseconds.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(path: impl AsRef<str>) -> Result<Self, SqliteStoreError> {
        let connection_string = format!("sqlite:{}?mode=rwc", path.as_ref());
        let pool = SqlitePoolOptions::new().connect(&connection_string).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, SqliteStoreError> {
        // Every connection to `:memory:` opens a separate database, so the
        // pool is pinned to a single connection that never expires.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

fn timestamp_from_ms(ms: i64) -> Result<Timestamp, SqliteStoreError> {
    Timestamp::from_millisecond(ms).map_err(|_| SqliteStoreError::InvalidTimestamp(ms))
}

fn device_from_row(row: &SqliteRow) -> Result<Device, SqliteStoreError> {
    let last_seen = row
        .try_get::<Option<i64>, _>("last_seen")?
        .map(timestamp_from_ms)
        .transpose()?;

    Ok(Device {
        addr: DeviceAddr::new(row.try_get::<String, _>("addr")?),
        hostname: row.try_get::<String, _>("hostname")?.into(),
        model: row.try_get::<String, _>("model")?.into(),
        asic_model: row.try_get::<String, _>("asic_model")?.into(),
        active: row.try_get::<bool, _>("active")?,
        last_seen,
        asset_override: row
            .try_get::<Option<String>, _>("asset_override")?
            .map(Into::into),
    })
}

fn share_from_row(row: &SqliteRow) -> Result<Share, SqliteStoreError> {
    Ok(Share {
        addr: DeviceAddr::new(row.try_get::<String, _>("addr")?),
        hostname: row.try_get::<String, _>("hostname")?.into(),
        timestamp: timestamp_from_ms(row.try_get("timestamp")?)?,
        job_id: row.try_get::<String, _>("job_id")?.into(),
        asic: row.try_get::<i64, _>("asic")? as u32,
        difficulty: row.try_get("difficulty")?,
    })
}

fn block_from_row(row: &SqliteRow) -> Result<Block, SqliteStoreError> {
    Ok(Block {
        addr: DeviceAddr::new(row.try_get::<String, _>("addr")?),
        hostname: row.try_get::<String, _>("hostname")?.into(),
        timestamp: timestamp_from_ms(row.try_get("timestamp")?)?,
        difficulty: row.try_get("difficulty")?,
        network_difficulty: row.try_get("network_difficulty")?,
        value: BlockValue {
            asset_id: row.try_get::<String, _>("asset_id")?.into(),
            symbol: row.try_get::<String, _>("symbol")?.into(),
            unit_reward: row.try_get("unit_reward")?,
            unit_price: row.try_get("unit_price")?,
            value_usd: row.try_get("value_usd")?,
        },
    })
}

#[async_trait]
impl Store for SqliteStore {
    type Error = SqliteStoreError;

    async fn upsert_device(&self, device: Device) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO devices (addr, hostname, model, asic_model, active, last_seen, asset_override)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(addr) DO UPDATE SET
                hostname = excluded.hostname,
                model = excluded.model,
                asic_model = excluded.asic_model,
                active = excluded.active,
                last_seen = COALESCE(excluded.last_seen, devices.last_seen),
                asset_override = COALESCE(excluded.asset_override, devices.asset_override)
            "#,
        )
        .bind(device.addr.0.to_string())
        .bind(device.hostname.to_string())
        .bind(device.model.to_string())
        .bind(device.asic_model.to_string())
        .bind(device.active)
        .bind(device.last_seen.map(|t| t.as_millisecond()))
        .bind(device.asset_override.map(String::from))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_device(&self, addr: &DeviceAddr) -> Result<Option<Device>, Self::Error> {
        let row = sqlx::query("SELECT * FROM devices WHERE addr = ?")
            .bind(addr.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(device_from_row).transpose()
    }

    async fn list_active_devices(&self) -> Result<Vec<Device>, Self::Error> {
        let rows = sqlx::query("SELECT * FROM devices WHERE active = 1 ORDER BY addr")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(device_from_row).collect()
    }

    async fn deactivate_device(&self, addr: &DeviceAddr) -> Result<bool, Self::Error> {
        let result = sqlx::query("UPDATE devices SET active = 0 WHERE addr = ?")
            .bind(addr.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_asset_override(
        &self,
        addr: &DeviceAddr,
        asset: Option<&str>,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query("UPDATE devices SET asset_override = ? WHERE addr = ?")
            .bind(asset)
            .bind(addr.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn devices_with_asset_override(&self) -> Result<Vec<(DeviceAddr, Box<str>)>, Self::Error> {
        let rows = sqlx::query(
            "SELECT addr, asset_override FROM devices WHERE asset_override IS NOT NULL AND asset_override != ''",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<_, SqliteStoreError> {
                Ok((
                    DeviceAddr::new(row.try_get::<String, _>("addr")?),
                    row.try_get::<String, _>("asset_override")?.into(),
                ))
            })
            .collect()
    }

    async fn insert_snapshot(&self, snapshot: Snapshot) -> Result<(), Self::Error> {
        let data = serde_json::to_string(&snapshot)?;

        sqlx::query("INSERT INTO snapshots (addr, timestamp, data) VALUES (?, ?, ?)")
            .bind(snapshot.addr.0.to_string())
            .bind(snapshot.timestamp.as_millisecond())
            .bind(data)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn latest_snapshot(&self, addr: &DeviceAddr) -> Result<Option<Snapshot>, Self::Error> {
        let row = sqlx::query(
            "SELECT data FROM snapshots WHERE addr = ? ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(addr.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let data: String = row.try_get("data")?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn insert_share(&self, share: Share) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO shares (addr, hostname, timestamp, job_id, asic, difficulty)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(share.addr.0.to_string())
        .bind(share.hostname.to_string())
        .bind(share.timestamp.as_millisecond())
        .bind(share.job_id.to_string())
        .bind(share.asic as i64)
        .bind(share.difficulty)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn best_share_between(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Option<Share>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT * FROM shares
            WHERE timestamp >= ? AND timestamp < ?
            ORDER BY difficulty DESC
            LIMIT 1
            "#,
        )
        .bind(start.as_millisecond())
        .bind(end.as_millisecond())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(share_from_row).transpose()
    }

    async fn insert_block(&self, block: Block) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO blocks (
                addr, hostname, timestamp, difficulty, network_difficulty,
                asset_id, symbol, unit_reward, unit_price, value_usd
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(block.addr.0.to_string())
        .bind(block.hostname.to_string())
        .bind(block.timestamp.as_millisecond())
        .bind(block.difficulty)
        .bind(block.network_difficulty)
        .bind(block.value.asset_id.to_string())
        .bind(block.value.symbol.to_string())
        .bind(block.value.unit_reward)
        .bind(block.value.unit_price)
        .bind(block.value.value_usd)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_blocks(&self, limit: usize) -> Result<Vec<Block>, Self::Error> {
        let rows = sqlx::query("SELECT * FROM blocks ORDER BY timestamp DESC, id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(block_from_row).collect()
    }

    async fn purge_snapshots_before(&self, cutoff: Timestamp) -> Result<u64, Self::Error> {
        let result = sqlx::query("DELETE FROM snapshots WHERE timestamp < ?")
            .bind(cutoff.as_millisecond())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_shares_before(&self, cutoff: Timestamp) -> Result<u64, Self::Error> {
        let result = sqlx::query("DELETE FROM shares WHERE timestamp < ?")
            .bind(cutoff.as_millisecond())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
