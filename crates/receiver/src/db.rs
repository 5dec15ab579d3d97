use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::persist::RecordStore;
use crate::record::{Location, PhStatus, SoilReading, StoredSoilRecord};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, FromRow)]
struct RecordRow {
    id: String,
    temperature: f64,
    moisture: f64,
    nitrogen: f64,
    phosphorus: f64,
    potassium: f64,
    ph: f64,
    conductivity: f64,
    timestamp: String,
    latitude: f64,
    longitude: f64,
    date_saved: String,
}

impl From<RecordRow> for StoredSoilRecord {
    fn from(r: RecordRow) -> Self {
        let data = SoilReading {
            temperature: r.temperature,
            moisture: r.moisture,
            nitrogen: r.nitrogen,
            phosphorus: r.phosphorus,
            potassium: r.potassium,
            ph: r.ph,
            conductivity: r.conductivity,
            timestamp: r.timestamp,
            location: Location {
                latitude: r.latitude,
                longitude: r.longitude,
            },
        };
        StoredSoilRecord {
            id: r.id,
            ph_status: PhStatus::classify(data.ph),
            data,
            date_saved: r.date_saved,
        }
    }
}

const SELECT_RECORD: &str = r#"
    SELECT id, temperature, moisture, nitrogen, phosphorus, potassium,
           ph, conductivity, timestamp, latitude, longitude, date_saved
    FROM soil_records
"#;

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/agni/agni.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Each in-memory connection is its own database.
        let in_memory = db_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Soil records
    // ----------------------------

    pub async fn insert_record(&self, reading: &SoilReading) -> Result<StoredSoilRecord> {
        let id = Uuid::now_v7().to_string();
        let date_saved = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format save time")?;

        sqlx::query(
            r#"
            INSERT INTO soil_records (
              id, temperature, moisture, nitrogen, phosphorus, potassium,
              ph, conductivity, timestamp, latitude, longitude, date_saved
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(reading.temperature)
        .bind(reading.moisture)
        .bind(reading.nitrogen)
        .bind(reading.phosphorus)
        .bind(reading.potassium)
        .bind(reading.ph)
        .bind(reading.conductivity)
        .bind(&reading.timestamp)
        .bind(reading.location.latitude)
        .bind(reading.location.longitude)
        .bind(&date_saved)
        .execute(&self.pool)
        .await
        .context("insert_record failed")?;

        Ok(StoredSoilRecord {
            id,
            data: reading.clone(),
            date_saved,
            ph_status: PhStatus::classify(reading.ph),
        })
    }

    /// All records, newest first.
    pub async fn load_records(&self) -> Result<Vec<StoredSoilRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!("{SELECT_RECORD} ORDER BY seq DESC"))
            .fetch_all(&self.pool)
            .await
            .context("load_records failed")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<StoredSoilRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(&format!("{SELECT_RECORD} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_record failed")?;
        Ok(row.map(Into::into))
    }

    pub async fn latest_record(&self) -> Result<Option<StoredSoilRecord>> {
        let row: Option<RecordRow> =
            sqlx::query_as(&format!("{SELECT_RECORD} ORDER BY seq DESC LIMIT 1"))
                .fetch_optional(&self.pool)
                .await
                .context("latest_record failed")?;
        Ok(row.map(Into::into))
    }

    /// Returns whether a record was removed.
    pub async fn delete_record(&self, id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM soil_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_record failed")?;
        Ok(res.rows_affected() > 0)
    }

    /// Returns the number of records removed.
    pub async fn clear_records(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM soil_records")
            .execute(&self.pool)
            .await
            .context("clear_records failed")?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl RecordStore for Db {
    async fn save_record(&self, reading: &SoilReading) -> Result<StoredSoilRecord> {
        self.insert_record(reading).await
    }

    async fn list_records(&self) -> Result<Vec<StoredSoilRecord>> {
        self.load_records().await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
