use aliri_braid::braid;

/// Study instance UID.
#[braid(serde)]
pub struct StudyUid;

/// Series instance UID.
#[braid(serde)]
pub struct SeriesUid;

/// SOP instance UID.
#[braid(serde)]
pub struct SopUid;

/// Site-unique patient identifier.
#[braid(serde)]
pub struct PatientId;

/// Our AE title.
#[braid(serde)]
pub struct OurAETitle;

/// The AE title of a peer PACS server pushing DICOMs to us.
#[braid(serde)]
pub struct ClientAETitle;

/// Opaque handle to an instance file in the object store.
#[braid(serde)]
pub struct StorageKey;

/// Whether `s` is a legal DICOM unique identifier: non-empty, at most 64
/// characters, digits and dots only.
pub fn is_valid_uid(s: &str) -> bool {
    !s.is_empty() && s.len() <= 64 && s.chars().all(|c| c.is_ascii_digit() || c == '.')
}
