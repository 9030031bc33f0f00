//! Extraction of the indexed attribute set from a received dataset.

use dicom::core::DataDictionary;
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::{DefaultDicomObject, Tag};

use crate::error::MissingRequiredTag;
use crate::metadata_index::{InstanceAttrs, PatientAttrs, SeriesAttrs, StudyAttrs};
use crate::types::{is_valid_uid, PatientId, SeriesUid, SopUid, StudyUid};

/// The Patient/Study/Series/Instance attributes carried by one dataset.
#[derive(Debug)]
pub struct InstanceMetadata {
    pub patient_id: PatientId,
    pub patient: PatientAttrs,
    pub study_uid: StudyUid,
    pub study: StudyAttrs,
    pub series_uid: SeriesUid,
    pub series: SeriesAttrs,
    pub sop_uid: SopUid,
    pub instance: InstanceAttrs,
}

impl InstanceMetadata {
    /// Read the indexed attributes out of a dataset.
    ///
    /// The identifying UIDs, patient ID and image geometry are required;
    /// everything else is best-effort.
    pub fn from_object(dcm: &DefaultDicomObject) -> Result<Self, MissingRequiredTag> {
        let patient_id = PatientId::from(ttr(dcm, tags::PATIENT_ID)?);
        let study_uid = StudyUid::from(uid(dcm, tags::STUDY_INSTANCE_UID)?);
        let series_uid = SeriesUid::from(uid(dcm, tags::SERIES_INSTANCE_UID)?);
        let sop_uid = SopUid::from(uid(dcm, tags::SOP_INSTANCE_UID)?);
        let sop_class_uid = uid(dcm, tags::SOP_CLASS_UID)?;
        let rows = tti(dcm, tags::ROWS).ok_or_else(|| missing(tags::ROWS))?;
        let columns = tti(dcm, tags::COLUMNS).ok_or_else(|| missing(tags::COLUMNS))?;

        Ok(Self {
            patient_id,
            patient: PatientAttrs {
                name: tts(dcm, tags::PATIENT_NAME),
                birth_date: tts(dcm, tags::PATIENT_BIRTH_DATE),
                sex: tts(dcm, tags::PATIENT_SEX),
            },
            study_uid,
            study: StudyAttrs {
                accession_number: tts(dcm, tags::ACCESSION_NUMBER),
                study_date: tts(dcm, tags::STUDY_DATE),
                study_time: tts(dcm, tags::STUDY_TIME),
                referring_physician: tts(dcm, tags::REFERRING_PHYSICIAN_NAME),
                description: tts(dcm, tags::STUDY_DESCRIPTION),
                // The study modality mirrors the first series seen under it.
                modality: tts(dcm, tags::MODALITY),
            },
            series_uid,
            series: SeriesAttrs {
                series_number: tti(dcm, tags::SERIES_NUMBER),
                modality: tts(dcm, tags::MODALITY),
                description: tts(dcm, tags::SERIES_DESCRIPTION),
                body_part: tts(dcm, tags::BODY_PART_EXAMINED),
                pixel_spacing: ttj(dcm, tags::PIXEL_SPACING),
                slice_thickness: ttf(dcm, tags::SLICE_THICKNESS),
            },
            sop_uid,
            instance: InstanceAttrs {
                sop_class_uid,
                instance_number: tti(dcm, tags::INSTANCE_NUMBER),
                rows,
                columns,
                bits_allocated: tti(dcm, tags::BITS_ALLOCATED),
                pixel_representation: tti(dcm, tags::PIXEL_REPRESENTATION),
                photometric: tts(dcm, tags::PHOTOMETRIC_INTERPRETATION),
                window_center: ttf(dcm, tags::WINDOW_CENTER),
                window_width: ttf(dcm, tags::WINDOW_WIDTH),
                rescale_slope: ttf(dcm, tags::RESCALE_SLOPE),
                rescale_intercept: ttf(dcm, tags::RESCALE_INTERCEPT),
            },
        })
    }
}

/// Required UID tag: present and a legal DICOM UID.
fn uid(dcm: &DefaultDicomObject, tag: Tag) -> Result<String, MissingRequiredTag> {
    let value = ttr(dcm, tag)?;
    if is_valid_uid(&value) {
        Ok(value)
    } else {
        Err(missing(tag))
    }
}

/// Required string tag.
fn ttr(dcm: &DefaultDicomObject, tag: Tag) -> Result<String, MissingRequiredTag> {
    tt(dcm, tag)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| missing(tag))
}

/// Optional string tag.
fn tts(dcm: &DefaultDicomObject, tag: Tag) -> Option<String> {
    tt(dcm, tag)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Try to get the trimmed string value of a tag.
fn tt(dcm: &DefaultDicomObject, tag: Tag) -> Option<&str> {
    dcm.element(tag)
        .ok()
        .and_then(|e| e.string().map(|s| s.trim_matches(['\0', ' '])).ok())
}

/// Optional multi-valued string tag, joined with `\`.
fn ttj(dcm: &DefaultDicomObject, tag: Tag) -> Option<String> {
    dcm.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_matches(['\0', ' ']).to_string())
        .filter(|s| !s.is_empty())
}

/// Optional integer tag.
fn tti(dcm: &DefaultDicomObject, tag: Tag) -> Option<i64> {
    dcm.element(tag).ok().and_then(|e| e.to_int::<i64>().ok())
}

/// Optional float tag. Multi-valued elements yield their first value.
fn ttf(dcm: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    dcm.element(tag).ok().and_then(|e| e.to_float64().ok())
}

fn missing(tag: Tag) -> MissingRequiredTag {
    MissingRequiredTag(name_of(tag).unwrap_or("unknown"))
}

/// The standard name of a tag.
fn name_of(tag: Tag) -> Option<&'static str> {
    StandardDataDictionary.by_tag(tag).map(|e| e.alias)
}
