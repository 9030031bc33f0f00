//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use camino::Utf8PathBuf;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};

use noctis::events::IngestNotifier;
use noctis::ingest::{AssociationPeer, IngestContext};
use noctis::types::{ClientAETitle, OurAETitle};
use noctis::{MetadataIndex, ObjectStore};

pub const STUDY_UID: &str = "1.2.840.1.study";
pub const SERIES_UID: &str = "1.2.840.1.series";

/// A synthetic 16-bit signed CT dataset (no file meta group).
pub fn ct_dataset(sop_uid: &str, rows: u16, columns: u16) -> InMemDicomObject {
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
        dicom_value!(Str, STUDY_UID),
    ));
    obj.put(DataElement::new(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, SERIES_UID),
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
    obj.put(DataElement::new(
        tags::SERIES_NUMBER,
        VR::IS,
        dicom_value!(Str, "2"),
    ));
    obj.put(DataElement::new(
        tags::INSTANCE_NUMBER,
        VR::IS,
        dicom_value!(Str, "1"),
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
    obj.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [rows])));
    obj.put(DataElement::new(
        tags::COLUMNS,
        VR::US,
        dicom_value!(U16, [columns]),
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
        tags::WINDOW_CENTER,
        VR::DS,
        dicom_value!(Str, "40"),
    ));
    obj.put(DataElement::new(
        tags::WINDOW_WIDTH,
        VR::DS,
        dicom_value!(Str, "400"),
    ));
    obj.put(DataElement::new(
        tags::RESCALE_SLOPE,
        VR::DS,
        dicom_value!(Str, "1"),
    ));
    obj.put(DataElement::new(
        tags::RESCALE_INTERCEPT,
        VR::DS,
        dicom_value!(Str, "0"),
    ));
    let words: Vec<u16> = (0..i32::from(rows) * i32::from(columns))
        .map(|i| (i % 2000 - 1000) as i16 as u16)
        .collect();
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::U16(words.into()),
    ));
    obj
}

/// The same dataset as a Part 10 file object, ready for ingest.
pub fn ct_instance(sop_uid: &str, rows: u16, columns: u16) -> DefaultDicomObject {
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop_uid)
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .build()
        .unwrap();
    ct_dataset(sop_uid, rows, columns).with_exact_meta(meta)
}

pub fn index_url(dir: &std::path::Path) -> String {
    format!("sqlite://{}/index.sqlite?mode=rwc", dir.display())
}

pub async fn ingest_context(dir: &std::path::Path) -> IngestContext {
    let store_root = Utf8PathBuf::from_path_buf(dir.join("store")).unwrap();
    IngestContext {
        index: MetadataIndex::connect(&index_url(dir), 1).await.unwrap(),
        store: std::sync::Arc::new(ObjectStore::open_root(store_root, false).unwrap()),
        notifier: IngestNotifier::default(),
        aet: OurAETitle::from("STORE_SCP"),
    }
}

pub fn peer() -> AssociationPeer {
    AssociationPeer {
        aec: ClientAETitle::from("TESTSCU"),
        peer_addr: Some("127.0.0.1:40000".into()),
    }
}
