//! The durable, queryable authority for patients, studies, series, instances
//! and the ingest log.
//!
//! Backed by sqlx over the `Any` driver so the same DAO runs against
//! PostgreSQL in production and SQLite in tests. Migrations are forward-only
//! and applied at connect time.

use serde::Serialize;
use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Row, Transaction};
use time::format_description::well_known::Rfc3339;

use crate::error::IndexError;
use crate::types::{
    ClientAETitle, OurAETitle, PatientIdRef, SeriesUid, SeriesUidRef, SopUid, SopUidRef,
    StorageKey, StorageKeyRef, StudyUidRef,
};

const MIGRATIONS: &[(&str, &str)] = &[("0001_init", include_str!("migrations/0001_init.sql"))];

#[derive(Clone)]
pub struct MetadataIndex {
    pool: AnyPool,
}

/// Attributes recorded for a patient. First-seen values win; later non-null
/// values only fill blanks.
#[derive(Debug, Clone, Default)]
pub struct PatientAttrs {
    pub name: Option<String>,
    pub birth_date: Option<String>,
    pub sex: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StudyAttrs {
    pub accession_number: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub referring_physician: Option<String>,
    pub description: Option<String>,
    pub modality: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SeriesAttrs {
    pub series_number: Option<i64>,
    pub modality: Option<String>,
    pub description: Option<String>,
    pub body_part: Option<String>,
    pub pixel_spacing: Option<String>,
    pub slice_thickness: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct InstanceAttrs {
    pub sop_class_uid: String,
    pub instance_number: Option<i64>,
    pub rows: i64,
    pub columns: i64,
    pub bits_allocated: Option<i64>,
    pub pixel_representation: Option<i64>,
    pub photometric: Option<String>,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
}

/// Everything needed to register one received instance.
pub struct NewInstance<'a> {
    pub patient_id: &'a PatientIdRef,
    pub patient: PatientAttrs,
    pub study_uid: &'a StudyUidRef,
    pub study: StudyAttrs,
    pub series_uid: &'a SeriesUidRef,
    pub series: SeriesAttrs,
    pub sop_uid: &'a SopUidRef,
    pub instance: InstanceAttrs,
    pub storage_key: &'a StorageKeyRef,
    pub sha256: &'a str,
    pub file_size: i64,
}

/// Outcome of [MetadataIndex::begin_registration].
#[derive(Debug)]
pub enum Registration {
    /// The SOP instance UID already exists; nothing was written.
    Duplicate,
    /// Rows are staged in an open transaction; call
    /// [PendingRegistration::commit] once the file is in its final place.
    Pending(PendingRegistration),
}

/// An ingest transaction holding the staged instance row. Dropping it rolls
/// everything back.
#[derive(Debug)]
pub struct PendingRegistration {
    tx: Transaction<'static, Any>,
}

impl PendingRegistration {
    pub async fn commit(self) -> Result<(), IndexError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesSummary {
    #[serde(rename = "seriesUid")]
    pub series_uid: SeriesUid,
    pub number: Option<i64>,
    pub modality: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "imageCount")]
    pub image_count: i64,
    #[serde(rename = "firstInstanceUid")]
    pub first_instance_uid: Option<SopUid>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstanceSummary {
    #[serde(rename = "instanceUid")]
    pub instance_uid: SopUid,
    pub number: Option<i64>,
    pub rows: i64,
    pub cols: i64,
}

/// The full projection of one instance row, joined with its series.
#[derive(Debug, Clone)]
pub struct InstanceFull {
    pub sop_uid: SopUid,
    pub series_uid: SeriesUid,
    pub sop_class_uid: String,
    pub instance_number: Option<i64>,
    pub rows: i64,
    pub columns: i64,
    pub bits_allocated: Option<i64>,
    pub pixel_representation: Option<i64>,
    pub photometric: Option<String>,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
    pub modality: Option<String>,
    pub storage_key: StorageKey,
    pub file_size: i64,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestResult {
    Stored,
    DuplicateIgnored,
    Rejected,
}

impl IngestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestResult::Stored => "stored",
            IngestResult::DuplicateIgnored => "duplicate_ignored",
            IngestResult::Rejected => "rejected",
        }
    }
}

/// One row to append to the ingest log.
#[derive(Debug, Clone)]
pub struct IngestEvent {
    pub calling_aet: ClientAETitle,
    pub called_aet: OurAETitle,
    pub peer_addr: Option<String>,
    pub result: IngestResult,
    pub reject_reason: Option<String>,
    pub sop_uid: Option<SopUid>,
}

/// A committed ingest log row.
#[derive(Debug, Clone, Serialize)]
pub struct IngestEventRow {
    pub id: String,
    pub at: String,
    pub calling_aet: ClientAETitle,
    pub called_aet: OurAETitle,
    pub peer_addr: Option<String>,
    pub result: String,
    pub reject_reason: Option<String>,
    pub sop_uid: Option<SopUid>,
}

impl MetadataIndex {
    /// Connect to the index database and bring the schema up to date.
    pub async fn connect(url: &str, max_conns: u32) -> Result<Self, IndexError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_conns)
            .connect(url)
            .await?;
        let index = Self { pool };
        index.migrate().await?;
        Ok(index)
    }

    /// Whether the database answers a trivial query.
    pub async fn is_reachable(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn migrate(&self) -> Result<(), IndexError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        for &(name, sql) in MIGRATIONS {
            let applied = sqlx::query("SELECT name FROM schema_migrations WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            if applied.is_some() {
                continue;
            }
            let mut tx = self.pool.begin().await?;
            for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES ($1, $2)")
                .bind(name)
                .bind(now_rfc3339())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(event = "migration", name = name);
        }
        Ok(())
    }

    /// Stage the hierarchy rows for one received instance.
    ///
    /// Upserts patient, study and series in that order (first-seen attributes
    /// preserved, later values fill blanks only), inserts the instance row,
    /// and marks the series/study ready. A SOP instance UID conflict yields
    /// [Registration::Duplicate] without writing anything.
    pub async fn begin_registration(
        &self,
        new: NewInstance<'_>,
    ) -> Result<Registration, IndexError> {
        let mut tx = self.pool.begin().await?;

        upsert_patient(&mut tx, new.patient_id, &new.patient).await?;
        upsert_study(&mut tx, new.study_uid, new.patient_id, &new.study).await?;
        upsert_series(&mut tx, new.series_uid, new.study_uid, &new.series).await?;

        let inserted = sqlx::query(
            "INSERT INTO instances (sop_instance_uid, series_instance_uid, sop_class_uid, \
             instance_number, num_rows, num_columns, bits_allocated, pixel_representation, \
             photometric, window_center, window_width, rescale_slope, rescale_intercept, \
             storage_key, file_size, sha256, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             ON CONFLICT (sop_instance_uid) DO NOTHING",
        )
        .bind(new.sop_uid.as_str())
        .bind(new.series_uid.as_str())
        .bind(&new.instance.sop_class_uid)
        .bind(new.instance.instance_number)
        .bind(new.instance.rows)
        .bind(new.instance.columns)
        .bind(new.instance.bits_allocated)
        .bind(new.instance.pixel_representation)
        .bind(new.instance.photometric.as_deref())
        .bind(new.instance.window_center)
        .bind(new.instance.window_width)
        .bind(new.instance.rescale_slope)
        .bind(new.instance.rescale_intercept)
        .bind(new.storage_key.as_str())
        .bind(new.file_size)
        .bind(new.sha256)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Ok(Registration::Duplicate);
        }

        sqlx::query("UPDATE series SET status = 'ready' WHERE series_instance_uid = $1")
            .bind(new.series_uid.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE studies SET status = 'ready' WHERE study_instance_uid = $1 AND NOT EXISTS \
             (SELECT 1 FROM series s WHERE s.study_instance_uid = $2 AND s.status <> 'ready')",
        )
        .bind(new.study_uid.as_str())
        .bind(new.study_uid.as_str())
        .execute(&mut *tx)
        .await?;

        Ok(Registration::Pending(PendingRegistration { tx }))
    }

    /// Series of a study, ordered by series number then series UID.
    pub async fn list_series(
        &self,
        study_uid: &StudyUidRef,
    ) -> Result<Vec<SeriesSummary>, IndexError> {
        let known = sqlx::query("SELECT study_instance_uid FROM studies WHERE study_instance_uid = $1")
            .bind(study_uid.as_str())
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(IndexError::NotFound {
                entity: "study",
                uid: study_uid.to_string(),
            });
        }
        let rows = sqlx::query(
            "SELECT s.series_instance_uid, s.series_number, s.modality, s.description, \
             (SELECT COUNT(*) FROM instances i WHERE i.series_instance_uid = s.series_instance_uid) AS image_count, \
             (SELECT i.sop_instance_uid FROM instances i WHERE i.series_instance_uid = s.series_instance_uid \
              ORDER BY i.instance_number, i.sop_instance_uid LIMIT 1) AS first_instance_uid \
             FROM series s WHERE s.study_instance_uid = $1 \
             ORDER BY s.series_number, s.series_instance_uid",
        )
        .bind(study_uid.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(SeriesSummary {
                    series_uid: SeriesUid::from(row.try_get::<String, _>("series_instance_uid")?),
                    number: row.try_get("series_number")?,
                    modality: row.try_get("modality")?,
                    description: row.try_get("description")?,
                    image_count: row.try_get("image_count")?,
                    first_instance_uid: row
                        .try_get::<Option<String>, _>("first_instance_uid")?
                        .map(SopUid::from),
                })
            })
            .collect()
    }

    /// Instances of a series, ordered by instance number then SOP UID.
    pub async fn list_instances(
        &self,
        series_uid: &SeriesUidRef,
    ) -> Result<Vec<InstanceSummary>, IndexError> {
        let known = sqlx::query("SELECT series_instance_uid FROM series WHERE series_instance_uid = $1")
            .bind(series_uid.as_str())
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(IndexError::NotFound {
                entity: "series",
                uid: series_uid.to_string(),
            });
        }
        let rows = sqlx::query(
            "SELECT sop_instance_uid, instance_number, num_rows, num_columns \
             FROM instances WHERE series_instance_uid = $1 \
             ORDER BY instance_number, sop_instance_uid",
        )
        .bind(series_uid.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(InstanceSummary {
                    instance_uid: SopUid::from(row.try_get::<String, _>("sop_instance_uid")?),
                    number: row.try_get("instance_number")?,
                    rows: row.try_get("num_rows")?,
                    cols: row.try_get("num_columns")?,
                })
            })
            .collect()
    }

    /// The full projection of one instance.
    pub async fn get_instance(&self, sop_uid: &SopUidRef) -> Result<InstanceFull, IndexError> {
        let row = sqlx::query(
            "SELECT i.sop_instance_uid, i.series_instance_uid, i.sop_class_uid, i.instance_number, \
             i.num_rows, i.num_columns, i.bits_allocated, i.pixel_representation, i.photometric, \
             i.window_center, i.window_width, i.rescale_slope, i.rescale_intercept, \
             i.storage_key, i.file_size, i.sha256, s.modality \
             FROM instances i JOIN series s ON s.series_instance_uid = i.series_instance_uid \
             WHERE i.sop_instance_uid = $1",
        )
        .bind(sop_uid.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| IndexError::NotFound {
            entity: "instance",
            uid: sop_uid.to_string(),
        })?;
        Ok(InstanceFull {
            sop_uid: SopUid::from(row.try_get::<String, _>("sop_instance_uid")?),
            series_uid: SeriesUid::from(row.try_get::<String, _>("series_instance_uid")?),
            sop_class_uid: row.try_get("sop_class_uid")?,
            instance_number: row.try_get("instance_number")?,
            rows: row.try_get("num_rows")?,
            columns: row.try_get("num_columns")?,
            bits_allocated: row.try_get("bits_allocated")?,
            pixel_representation: row.try_get("pixel_representation")?,
            photometric: row.try_get("photometric")?,
            window_center: row.try_get("window_center")?,
            window_width: row.try_get("window_width")?,
            rescale_slope: row.try_get("rescale_slope")?,
            rescale_intercept: row.try_get("rescale_intercept")?,
            modality: row.try_get("modality")?,
            storage_key: StorageKey::from(row.try_get::<String, _>("storage_key")?),
            file_size: row.try_get("file_size")?,
            sha256: row.try_get("sha256")?,
        })
    }

    /// Append a row to the ingest log.
    pub async fn record_event(&self, evt: &IngestEvent) -> Result<IngestEventRow, IndexError> {
        let row = IngestEventRow {
            id: ulid::Ulid::new().to_string(),
            at: now_rfc3339(),
            calling_aet: evt.calling_aet.clone(),
            called_aet: evt.called_aet.clone(),
            peer_addr: evt.peer_addr.clone(),
            result: evt.result.as_str().to_string(),
            reject_reason: evt.reject_reason.clone(),
            sop_uid: evt.sop_uid.clone(),
        };
        sqlx::query(
            "INSERT INTO ingest_events (id, at, calling_aet, called_aet, peer_addr, result, \
             reject_reason, sop_instance_uid) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&row.id)
        .bind(&row.at)
        .bind(row.calling_aet.as_str())
        .bind(row.called_aet.as_str())
        .bind(row.peer_addr.as_deref())
        .bind(&row.result)
        .bind(row.reject_reason.as_deref())
        .bind(row.sop_uid.as_ref().map(|u| u.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(row)
    }

    /// Ingest log rows after `since_id` (a ULID cursor), oldest first.
    pub async fn list_events(
        &self,
        since_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<IngestEventRow>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, at, calling_aet, called_aet, peer_addr, result, reject_reason, \
             sop_instance_uid FROM ingest_events WHERE id > $1 ORDER BY id LIMIT $2",
        )
        .bind(since_id.unwrap_or(""))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(IngestEventRow {
                    id: row.try_get("id")?,
                    at: row.try_get("at")?,
                    calling_aet: ClientAETitle::from(row.try_get::<String, _>("calling_aet")?),
                    called_aet: OurAETitle::from(row.try_get::<String, _>("called_aet")?),
                    peer_addr: row.try_get("peer_addr")?,
                    result: row.try_get("result")?,
                    reject_reason: row.try_get("reject_reason")?,
                    sop_uid: row
                        .try_get::<Option<String>, _>("sop_instance_uid")?
                        .map(SopUid::from),
                })
            })
            .collect()
    }

    /// Remove one instance row, cascading to series and studies left empty.
    ///
    /// Returns the storage key of the removed instance so the caller can
    /// delete the object-store file in the same unit of work.
    pub async fn delete_instance(
        &self,
        sop_uid: &SopUidRef,
    ) -> Result<StorageKey, IndexError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT series_instance_uid, storage_key FROM instances WHERE sop_instance_uid = $1",
        )
        .bind(sop_uid.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| IndexError::NotFound {
            entity: "instance",
            uid: sop_uid.to_string(),
        })?;
        let series_uid: String = row.try_get("series_instance_uid")?;
        let storage_key: String = row.try_get("storage_key")?;

        sqlx::query("DELETE FROM instances WHERE sop_instance_uid = $1")
            .bind(sop_uid.as_str())
            .execute(&mut *tx)
            .await?;

        let study_row = sqlx::query(
            "SELECT study_instance_uid FROM series WHERE series_instance_uid = $1",
        )
        .bind(&series_uid)
        .fetch_one(&mut *tx)
        .await?;
        let study_uid: String = study_row.try_get("study_instance_uid")?;

        let emptied = sqlx::query(
            "DELETE FROM series WHERE series_instance_uid = $1 AND NOT EXISTS \
             (SELECT 1 FROM instances i WHERE i.series_instance_uid = $2)",
        )
        .bind(&series_uid)
        .bind(&series_uid)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if emptied > 0 {
            sqlx::query(
                "DELETE FROM studies WHERE study_instance_uid = $1 AND NOT EXISTS \
                 (SELECT 1 FROM series s WHERE s.study_instance_uid = $2)",
            )
            .bind(&study_uid)
            .bind(&study_uid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(StorageKey::from(storage_key))
    }
}

async fn upsert_patient(
    tx: &mut Transaction<'static, Any>,
    patient_id: &PatientIdRef,
    attrs: &PatientAttrs,
) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO patients (patient_id, name, birth_date, sex, created_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (patient_id) DO UPDATE SET \
         name = COALESCE(patients.name, excluded.name), \
         birth_date = COALESCE(patients.birth_date, excluded.birth_date), \
         sex = COALESCE(patients.sex, excluded.sex)",
    )
    .bind(patient_id.as_str())
    .bind(attrs.name.as_deref())
    .bind(attrs.birth_date.as_deref())
    .bind(attrs.sex.as_deref())
    .bind(now_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_study(
    tx: &mut Transaction<'static, Any>,
    study_uid: &StudyUidRef,
    patient_id: &PatientIdRef,
    attrs: &StudyAttrs,
) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO studies (study_instance_uid, patient_id, accession_number, study_date, \
         study_time, referring_physician, description, modality, status, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'received', $9) \
         ON CONFLICT (study_instance_uid) DO UPDATE SET \
         accession_number = COALESCE(studies.accession_number, excluded.accession_number), \
         study_date = COALESCE(studies.study_date, excluded.study_date), \
         study_time = COALESCE(studies.study_time, excluded.study_time), \
         referring_physician = COALESCE(studies.referring_physician, excluded.referring_physician), \
         description = COALESCE(studies.description, excluded.description), \
         modality = COALESCE(studies.modality, excluded.modality)",
    )
    .bind(study_uid.as_str())
    .bind(patient_id.as_str())
    .bind(attrs.accession_number.as_deref())
    .bind(attrs.study_date.as_deref())
    .bind(attrs.study_time.as_deref())
    .bind(attrs.referring_physician.as_deref())
    .bind(attrs.description.as_deref())
    .bind(attrs.modality.as_deref())
    .bind(now_rfc3339())
    .execute(&mut **tx)
    .await?;

    let owner = sqlx::query("SELECT patient_id FROM studies WHERE study_instance_uid = $1")
        .bind(study_uid.as_str())
        .fetch_one(&mut **tx)
        .await?;
    let owner: String = owner.try_get("patient_id")?;
    if owner != patient_id.as_str() {
        return Err(IndexError::Conflict(format!(
            "study \"{study_uid}\" belongs to another patient"
        )));
    }
    Ok(())
}

async fn upsert_series(
    tx: &mut Transaction<'static, Any>,
    series_uid: &SeriesUidRef,
    study_uid: &StudyUidRef,
    attrs: &SeriesAttrs,
) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO series (series_instance_uid, study_instance_uid, series_number, modality, \
         description, body_part, pixel_spacing, slice_thickness, status, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'received', $9) \
         ON CONFLICT (series_instance_uid) DO UPDATE SET \
         series_number = COALESCE(series.series_number, excluded.series_number), \
         modality = COALESCE(series.modality, excluded.modality), \
         description = COALESCE(series.description, excluded.description), \
         body_part = COALESCE(series.body_part, excluded.body_part), \
         pixel_spacing = COALESCE(series.pixel_spacing, excluded.pixel_spacing), \
         slice_thickness = COALESCE(series.slice_thickness, excluded.slice_thickness)",
    )
    .bind(series_uid.as_str())
    .bind(study_uid.as_str())
    .bind(attrs.series_number)
    .bind(attrs.modality.as_deref())
    .bind(attrs.description.as_deref())
    .bind(attrs.body_part.as_deref())
    .bind(attrs.pixel_spacing.as_deref())
    .bind(attrs.slice_thickness)
    .bind(now_rfc3339())
    .execute(&mut **tx)
    .await?;

    let owner = sqlx::query("SELECT study_instance_uid FROM series WHERE series_instance_uid = $1")
        .bind(series_uid.as_str())
        .fetch_one(&mut **tx)
        .await?;
    let owner: String = owner.try_get("study_instance_uid")?;
    if owner != study_uid.as_str() {
        return Err(IndexError::Conflict(format!(
            "series \"{series_uid}\" belongs to another study"
        )));
    }
    Ok(())
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("RFC 3339 formatting of the current time cannot fail")
}
