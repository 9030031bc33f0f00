//! Per-instance pipeline between C-STORE reception and the C-STORE response.
//!
//! Runs synchronously from the SCU's point of view: the instance is hashed,
//! staged in the metadata index, moved to its canonical object-store path and
//! committed before the DICOM status goes out. The index transaction stays
//! open across the file move so a failure on either side rolls back both.

use std::time::Duration;

use dicom::object::DefaultDicomObject;

use crate::error::IngestError;
use crate::events::IngestNotifier;
use crate::instance_metadata::InstanceMetadata;
use crate::metadata_index::{
    IngestEvent, IngestResult, MetadataIndex, NewInstance, Registration,
};
use crate::object_store::{canonical_key, sha256_hex_of_file, LayoutHint, ObjectStore};
use crate::types::{ClientAETitle, OurAETitle, SopUid};

const REGISTRATION_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Shared dependencies of the ingest pipeline.
#[derive(Clone)]
pub struct IngestContext {
    pub index: MetadataIndex,
    pub store: std::sync::Arc<ObjectStore>,
    pub notifier: IngestNotifier,
    pub aet: OurAETitle,
}

/// The peer on the other side of the association.
#[derive(Debug, Clone)]
pub struct AssociationPeer {
    pub aec: ClientAETitle,
    pub peer_addr: Option<String>,
}

/// What became of one received instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { sop_uid: SopUid },
    Duplicate { sop_uid: SopUid },
}

/// Run the post-reception pipeline for one dataset.
///
/// On success the instance is durable in both the object store and the
/// metadata index, and a `stored` event has been appended. Failures leave no
/// partial state behind and map onto a DICOM status via
/// [IngestError::dicom_status].
pub async fn ingest_instance(
    ctx: &IngestContext,
    obj: DefaultDicomObject,
    peer: &AssociationPeer,
) -> Result<IngestOutcome, IngestError> {
    match run_pipeline(ctx, obj, peer).await {
        Ok(outcome) => {
            let (result, sop_uid) = match &outcome {
                IngestOutcome::Stored { sop_uid } => (IngestResult::Stored, sop_uid.clone()),
                IngestOutcome::Duplicate { sop_uid } => {
                    (IngestResult::DuplicateIgnored, sop_uid.clone())
                }
            };
            record_event(ctx, peer, result, None, Some(sop_uid)).await;
            Ok(outcome)
        }
        Err(e) => {
            record_event(ctx, peer, IngestResult::Rejected, Some(e.to_string()), None).await;
            Err(e)
        }
    }
}

async fn run_pipeline(
    ctx: &IngestContext,
    obj: DefaultDicomObject,
    peer: &AssociationPeer,
) -> Result<IngestOutcome, IngestError> {
    let meta = InstanceMetadata::from_object(&obj)?;

    // Write the Part 10 form to staging and hash the bytes that will be
    // served later.
    let mut staged = ctx.store.stage_new()?;
    obj.write_all(&mut staged)
        .map_err(|e| IngestError::Unreadable(e.to_string()))?;
    staged.flush_writes()?;
    let (sha256, file_size) = sha256_hex_of_file(staged.path())?;

    let layout = LayoutHint {
        patient_id: &meta.patient_id,
        study_uid: &meta.study_uid,
        series_uid: &meta.series_uid,
        sop_uid: &meta.sop_uid,
    };
    let storage_key = canonical_key(&layout);

    let pending = {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let registration = ctx
                .index
                .begin_registration(NewInstance {
                    patient_id: &meta.patient_id,
                    patient: meta.patient.clone(),
                    study_uid: &meta.study_uid,
                    study: meta.study.clone(),
                    series_uid: &meta.series_uid,
                    series: meta.series.clone(),
                    sop_uid: &meta.sop_uid,
                    instance: meta.instance.clone(),
                    storage_key: &storage_key,
                    sha256: &sha256,
                    file_size: file_size as i64,
                })
                .await;
            match registration {
                Ok(r) => break r,
                Err(e) if e.is_transient() && attempt < REGISTRATION_ATTEMPTS => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt - 1) + jitter();
                    tracing::warn!(
                        event = "registration_retry",
                        attempt = attempt,
                        error = e.to_string(),
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let pending = match pending {
        Registration::Duplicate => {
            // The staged file is discarded on drop.
            tracing::info!(
                event = "duplicate_ignored",
                sop_uid = meta.sop_uid.as_str(),
                aec = peer.aec.as_str(),
            );
            return Ok(IngestOutcome::Duplicate { sop_uid: meta.sop_uid });
        }
        Registration::Pending(pending) => pending,
    };

    let key = ctx.store.finalize_at(staged, &layout)?;

    if let Err(e) = pending.commit().await {
        // The row never landed; take the file back out so the two sides agree.
        let _ = ctx.store.remove(&key);
        return Err(e.into());
    }

    tracing::info!(
        event = "stored",
        sop_uid = meta.sop_uid.as_str(),
        storage_key = key.as_str(),
        size = file_size,
        aec = peer.aec.as_str(),
    );
    Ok(IngestOutcome::Stored { sop_uid: meta.sop_uid })
}

/// Remove one instance from both the metadata index and the object store as
/// a single unit: the index row goes first (inside a transaction that also
/// drops emptied series and studies), the file after. File removal is
/// idempotent, so a crash between the two leaves only an orphaned file that
/// a re-run cleans up.
pub async fn delete_instance(ctx: &IngestContext, sop_uid: &SopUid) -> Result<(), IngestError> {
    let storage_key = ctx.index.delete_instance(sop_uid).await?;
    ctx.store.remove(&storage_key)?;
    tracing::info!(
        event = "deleted",
        sop_uid = sop_uid.as_str(),
        storage_key = storage_key.as_str(),
    );
    Ok(())
}

/// Append to the ingest log and notify subscribers. Best-effort: a sink
/// failure is logged and does not change the SCU-visible outcome.
pub async fn record_event(
    ctx: &IngestContext,
    peer: &AssociationPeer,
    result: IngestResult,
    reject_reason: Option<String>,
    sop_uid: Option<SopUid>,
) {
    let evt = IngestEvent {
        calling_aet: peer.aec.clone(),
        called_aet: ctx.aet.clone(),
        peer_addr: peer.peer_addr.clone(),
        result,
        reject_reason,
        sop_uid,
    };
    match ctx.index.record_event(&evt).await {
        Ok(row) => ctx.notifier.publish(row),
        Err(e) => tracing::error!(event = "ingest_event_write_failed", error = e.to_string()),
    }
}

fn jitter() -> Duration {
    let nanos = time::OffsetDateTime::now_utc().nanosecond();
    Duration::from_millis(u64::from(nanos % 25))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_index::MetadataIndex;
    use crate::render::parse_part10;
    use camino::Utf8PathBuf;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::dicom_value;
    use dicom::dictionary_std::{tags, uids};
    use dicom::object::{FileDicomObject, InMemDicomObject};

    fn ct_instance(sop_uid: &str) -> DefaultDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::CT_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_uid),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.1.study"),
        ));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.1.series"),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "P001"),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, "DOE^JANE"),
        ));
        obj.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            dicom_value!(Str, "CT"),
        ));
        obj.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [2])));
        obj.put(DataElement::new(
            tags::COLUMNS,
            VR::US,
            dicom_value!(U16, [2]),
        ));
        obj.put(DataElement::new(
            tags::BITS_ALLOCATED,
            VR::US,
            dicom_value!(U16, [16]),
        ));
        obj.put(DataElement::new(
            tags::BITS_STORED,
            VR::US,
            dicom_value!(U16, [16]),
        ));
        obj.put(DataElement::new(
            tags::HIGH_BIT,
            VR::US,
            dicom_value!(U16, [15]),
        ));
        obj.put(DataElement::new(
            tags::PIXEL_REPRESENTATION,
            VR::US,
            dicom_value!(U16, [1]),
        ));
        obj.put(DataElement::new(
            tags::SAMPLES_PER_PIXEL,
            VR::US,
            dicom_value!(U16, [1]),
        ));
        obj.put(DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            dicom_value!(Str, "MONOCHROME2"),
        ));
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::U16(vec![0u16, 100, 200, 300].into()),
        ));
        let meta = dicom::object::FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(sop_uid)
            .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .build()
            .unwrap();
        obj.with_exact_meta(meta)
    }

    async fn test_ctx() -> (tempfile::TempDir, IngestContext) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap();
        let url = format!("sqlite://{}/index.sqlite?mode=rwc", dir.path().display());
        let ctx = IngestContext {
            index: MetadataIndex::connect(&url, 1).await.unwrap(),
            store: std::sync::Arc::new(ObjectStore::open_root(root, false).unwrap()),
            notifier: IngestNotifier::default(),
            aet: OurAETitle::from("STORE_SCP"),
        };
        (dir, ctx)
    }

    fn peer() -> AssociationPeer {
        AssociationPeer {
            aec: ClientAETitle::from("ORTHANC"),
            peer_addr: Some("10.0.0.7:53104".into()),
        }
    }

    #[tokio::test]
    async fn test_stored_instance_is_durable_and_hashed() {
        let (_dir, ctx) = test_ctx().await;
        let outcome = ingest_instance(&ctx, ct_instance("1.2.840.1"), &peer())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));

        let sop = SopUid::from("1.2.840.1");
        let full = ctx.index.get_instance(&sop).await.unwrap();
        let bytes = ctx
            .store
            .read_verified(&full.storage_key, &full.sha256)
            .unwrap();
        assert_eq!(bytes.len() as i64, full.file_size);
        assert!(full.file_size > 0);

        // The stored bytes parse back to the same SOP instance.
        let parsed = parse_part10(&bytes).unwrap();
        let roundtrip: FileDicomObject<InMemDicomObject> = parsed;
        let got = roundtrip
            .element(tags::SOP_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(got.trim_end_matches('\0'), "1.2.840.1");
    }

    #[tokio::test]
    async fn test_second_reception_is_duplicate() {
        let (_dir, ctx) = test_ctx().await;
        ingest_instance(&ctx, ct_instance("1.2.840.1"), &peer())
            .await
            .unwrap();
        let outcome = ingest_instance(&ctx, ct_instance("1.2.840.1"), &peer())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Duplicate { .. }));

        let events = ctx.index.list_events(None, 10).await.unwrap();
        let results: Vec<_> = events.iter().map(|e| e.result.as_str()).collect();
        assert_eq!(results, vec!["stored", "duplicate_ignored"]);

        let series = crate::types::SeriesUid::from("1.2.840.1.series");
        assert_eq!(ctx.index.list_instances(&series).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_ingest_of_same_sop_uid_stores_once() {
        let (_dir, ctx) = test_ctx().await;
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    ingest_instance(&ctx, ct_instance("1.2.840.1"), &peer())
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut stored = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                IngestOutcome::Stored { .. } => stored += 1,
                IngestOutcome::Duplicate { .. } => duplicates += 1,
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(duplicates, 7);

        let series = crate::types::SeriesUid::from("1.2.840.1.series");
        assert_eq!(ctx.index.list_instances(&series).await.unwrap().len(), 1);
        let events = ctx.index.list_events(None, 20).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.result == "stored").count(), 1);
        assert_eq!(
            events
                .iter()
                .filter(|e| e.result == "duplicate_ignored")
                .count(),
            7
        );
    }

    #[tokio::test]
    async fn test_missing_required_tag_is_rejected() {
        let (_dir, ctx) = test_ctx().await;
        let mut obj = ct_instance("1.2.840.2");
        obj.remove_element(tags::PATIENT_ID);
        let err = ingest_instance(&ctx, obj, &peer()).await.unwrap_err();
        assert_eq!(err.dicom_status(), 0xC000);

        let events = ctx.index.list_events(None, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result, "rejected");

        // No row and no file made it through.
        let sop = SopUid::from("1.2.840.2");
        assert!(ctx.index.get_instance(&sop).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_instance_removes_row_and_file() {
        let (_dir, ctx) = test_ctx().await;
        ingest_instance(&ctx, ct_instance("1.2.840.9"), &peer())
            .await
            .unwrap();
        let sop = SopUid::from("1.2.840.9");
        let full = ctx.index.get_instance(&sop).await.unwrap();

        delete_instance(&ctx, &sop).await.unwrap();
        assert!(ctx.index.get_instance(&sop).await.is_err());
        assert!(ctx.store.open(&full.storage_key).is_err());
        // Deleting again reports the missing row.
        assert!(delete_instance(&ctx, &sop).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribers_see_the_stored_event() {
        let (_dir, ctx) = test_ctx().await;
        let mut rx = ctx.notifier.subscribe();
        ingest_instance(&ctx, ct_instance("1.2.840.3"), &peer())
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.result, "stored");
        assert_eq!(event.sop_uid.as_ref().map(|u| u.as_str()), Some("1.2.840.3"));
    }
}
