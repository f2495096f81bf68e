use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pmp_common::PhotoStatus;
use sqlx::{types::Json, FromRow, PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use uuid::Uuid;

use super::{CandidateFilter, LegacyRepository, PhotoRepository, ProcessingLog};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    DerivativeSet, LegacyMigrationStatus, LegacyPhoto, LegacyProtocol, MigrationState,
    PhotoRecord, ProcessingLogEntry,
};

/// Postgres-backed repository for every pipeline table
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct PhotoRow {
    photo_id: Uuid,
    protocol_id: Uuid,
    status: String,
    original_hash: String,
    original_key: String,
    original_url: String,
    original_size: i64,
    derivatives: Option<Json<DerivativeSet>>,
    metadata: serde_json::Value,
    last_job_id: Option<Uuid>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PhotoRow> for PhotoRecord {
    type Error = PipelineError;

    fn try_from(row: PhotoRow) -> Result<Self, Self::Error> {
        Ok(PhotoRecord {
            photo_id: row.photo_id,
            protocol_id: row.protocol_id,
            status: row.status.parse::<PhotoStatus>()?,
            original_hash: row.original_hash,
            original_key: row.original_key,
            original_url: row.original_url,
            original_size: u64::try_from(row.original_size).unwrap_or_default(),
            derivatives: row.derivatives.map(|Json(set)| set),
            metadata: row.metadata,
            last_job_id: row.last_job_id,
            error: row.error,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

const PHOTO_COLUMNS: &str = "photo_id, protocol_id, status, original_hash, original_key, \
     original_url, original_size, derivatives, metadata, last_job_id, error, created_at, processed_at";

#[async_trait]
impl PhotoRepository for PgRepository {
    async fn upsert_photo(&self, record: &PhotoRecord) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO photo_records (
                photo_id, protocol_id, status, original_hash, original_key, original_url,
                original_size, derivatives, metadata, last_job_id, error, created_at, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (photo_id) DO UPDATE SET
                status = EXCLUDED.status,
                original_key = EXCLUDED.original_key,
                original_url = EXCLUDED.original_url,
                original_size = EXCLUDED.original_size,
                derivatives = EXCLUDED.derivatives,
                metadata = EXCLUDED.metadata,
                last_job_id = EXCLUDED.last_job_id,
                error = EXCLUDED.error,
                processed_at = EXCLUDED.processed_at
            "#,
        )
        .bind(record.photo_id)
        .bind(record.protocol_id)
        .bind(record.status.as_str())
        .bind(&record.original_hash)
        .bind(&record.original_key)
        .bind(&record.original_url)
        .bind(record.original_size as i64)
        .bind(record.derivatives.as_ref().map(Json))
        .bind(&record.metadata)
        .bind(record.last_job_id)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_photo(&self, photo_id: Uuid) -> PipelineResult<Option<PhotoRecord>> {
        let row: Option<PhotoRow> = sqlx::query_as(&format!(
            "SELECT {PHOTO_COLUMNS} FROM photo_records WHERE photo_id = $1"
        ))
        .bind(photo_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PhotoRecord::try_from).transpose()
    }

    async fn list_protocol_photos(&self, protocol_id: Uuid) -> PipelineResult<Vec<PhotoRecord>> {
        let rows: Vec<PhotoRow> = sqlx::query_as(&format!(
            "SELECT {PHOTO_COLUMNS} FROM photo_records WHERE protocol_id = $1 \
             ORDER BY created_at, photo_id"
        ))
        .bind(protocol_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PhotoRecord::try_from).collect()
    }

    async fn set_photo_status(
        &self,
        photo_id: Uuid,
        status: PhotoStatus,
        error: Option<&str>,
        job_id: Option<Uuid>,
    ) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE photo_records
            SET status = $2,
                error = $3,
                last_job_id = COALESCE($4, last_job_id),
                derivatives = NULL
            WHERE photo_id = $1
            "#,
        )
        .bind(photo_id)
        .bind(status.as_str())
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("photo {photo_id}")));
        }
        Ok(())
    }

    async fn attach_job(&self, photo_id: Uuid, job_id: Uuid) -> PipelineResult<()> {
        let result = sqlx::query(
            "UPDATE photo_records SET last_job_id = COALESCE(last_job_id, $2) WHERE photo_id = $1",
        )
        .bind(photo_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("photo {photo_id}")));
        }
        Ok(())
    }

    async fn delete_protocol_photos(&self, protocol_id: Uuid) -> PipelineResult<u64> {
        let result = sqlx::query("DELETE FROM photo_records WHERE protocol_id = $1")
            .bind(protocol_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(FromRow)]
struct LogRow {
    id: Uuid,
    protocol_id: Uuid,
    job_type: String,
    status: String,
    result_url: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<LogRow> for ProcessingLogEntry {
    fn from(row: LogRow) -> Self {
        Self {
            id: row.id,
            protocol_id: row.protocol_id,
            job_type: row.job_type,
            status: row.status,
            result_url: row.result_url,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl ProcessingLog for PgRepository {
    async fn record(&self, entry: &ProcessingLogEntry) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO protocol_processing_jobs
                (id, protocol_id, job_type, status, result_url, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.protocol_id)
        .bind(&entry.job_type)
        .bind(&entry.status)
        .bind(&entry.result_url)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => PipelineError::Conflict(format!(
                "{} entry for protocol {}: {}",
                entry.job_type,
                entry.protocol_id,
                db.message()
            )),
            _ => PipelineError::Database(e),
        })?;
        Ok(())
    }

    async fn latest(
        &self,
        protocol_id: Uuid,
        job_type: &str,
    ) -> PipelineResult<Option<ProcessingLogEntry>> {
        let row: Option<LogRow> = sqlx::query_as(
            r#"
            SELECT id, protocol_id, job_type, status, result_url, metadata, created_at
            FROM protocol_processing_jobs
            WHERE protocol_id = $1 AND job_type = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(protocol_id)
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn count(&self, protocol_id: Uuid, job_type: &str) -> PipelineResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM protocol_processing_jobs WHERE protocol_id = $1 AND job_type = $2",
        )
        .bind(protocol_id)
        .bind(job_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}

#[derive(FromRow)]
struct LegacyProtocolRow {
    id: Uuid,
    vehicle_id: Option<Uuid>,
    customer_id: Option<Uuid>,
    rental_id: Option<Uuid>,
    protocol_type: String,
    data: serde_json::Value,
    pdf_url: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct LegacyPhotoRow {
    id: Uuid,
    protocol_id: Uuid,
    photo_url: String,
    description: Option<String>,
    category: Option<String>,
}

#[async_trait]
impl LegacyRepository for PgRepository {
    async fn find_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> PipelineResult<Vec<LegacyProtocol>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, vehicle_id, customer_id, rental_id, protocol_type, data, pdf_url, created_at \
             FROM protocols WHERE TRUE",
        );
        if !filter.include_migrated {
            qb.push(" AND migrated_to_v2 IS NOT TRUE");
        }
        if let Some(ids) = &filter.protocol_ids {
            qb.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at <= ").push_bind(before);
        }
        qb.push(" ORDER BY created_at, id");

        let rows: Vec<LegacyProtocolRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let photo_rows: Vec<LegacyPhotoRow> = sqlx::query_as(
            r#"
            SELECT id, protocol_id, photo_url, description, category
            FROM protocol_photos
            WHERE protocol_id = ANY($1)
            ORDER BY created_at, id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut photos: HashMap<Uuid, Vec<LegacyPhoto>> = HashMap::new();
        for row in photo_rows {
            photos.entry(row.protocol_id).or_default().push(LegacyPhoto {
                id: row.id,
                url: row.photo_url,
                description: row.description,
                category: row.category,
            });
        }

        Ok(rows
            .into_iter()
            .map(|row| LegacyProtocol {
                photos: photos.remove(&row.id).unwrap_or_default(),
                id: row.id,
                vehicle_id: row.vehicle_id,
                customer_id: row.customer_id,
                rental_id: row.rental_id,
                protocol_type: row.protocol_type,
                data: row.data,
                pdf_url: row.pdf_url,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn copy_protocol_row(&self, protocol: &LegacyProtocol) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO protocols_v2 (
                id, original_protocol_id, vehicle_id, customer_id, rental_id,
                protocol_type, data, status, created_at, migrated_at
            )
            VALUES ($1, $1, $2, $3, $4, $5, $6, 'completed', $7, NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(protocol.id)
        .bind(protocol.vehicle_id)
        .bind(protocol.customer_id)
        .bind(protocol.rental_id)
        .bind(&protocol.protocol_type)
        .bind(&protocol.data)
        .bind(protocol.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_migration_state(
        &self,
        protocol_id: Uuid,
        state: MigrationState,
        error: Option<&str>,
    ) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE protocols SET migration_state = $2, migration_error = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(protocol_id)
        .bind(state.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_migrated(&self, protocol_id: Uuid) -> PipelineResult<()> {
        sqlx::query(
            r#"
            UPDATE protocols
            SET migrated_to_v2 = TRUE,
                migrated_at = NOW(),
                migration_state = 'migrated',
                migration_error = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(protocol_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn migration_status(
        &self,
        protocol_id: Uuid,
    ) -> PipelineResult<Option<LegacyMigrationStatus>> {
        let row: Option<(String, bool, Option<DateTime<Utc>>, Option<String>)> = sqlx::query_as(
            "SELECT migration_state, migrated_to_v2, migrated_at, migration_error \
             FROM protocols WHERE id = $1",
        )
        .bind(protocol_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(state, migrated, migrated_at, error)| {
            Ok(LegacyMigrationStatus {
                state: state.parse()?,
                migrated,
                migrated_at,
                error,
            })
        })
        .transpose()
    }

    async fn rollback_protocol(&self, protocol_id: Uuid) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM photo_records WHERE protocol_id = $1")
            .bind(protocol_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM protocol_processing_jobs WHERE protocol_id = $1")
            .bind(protocol_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM protocols_v2 WHERE id = $1")
            .bind(protocol_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE protocols
            SET migrated_to_v2 = FALSE,
                migrated_at = NULL,
                migration_state = 'not_migrated',
                migration_error = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(protocol_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn legacy_photo_count(&self, protocol_id: Uuid) -> PipelineResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM protocol_photos WHERE protocol_id = $1")
                .bind(protocol_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn migrated_row_exists(&self, protocol_id: Uuid) -> PipelineResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM protocols_v2 WHERE id = $1)")
                .bind(protocol_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}
