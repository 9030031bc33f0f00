//! Accepted storage presentation context options.

use dicom::dictionary_std::uids;

/// Abstract syntaxes negotiated by the store SCP: verification plus the
/// image storage SOP classes served by the delivery API.
pub static ABSTRACT_SYNTAXES: &[&str] = &[
    uids::VERIFICATION,
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE,
];

/// Accepted transfer syntaxes: the two uncompressed little-endian syntaxes
/// plus baseline JPEG.
pub static TRANSFER_SYNTAXES: &[&str] = &[
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    uids::JPEG_BASELINE8_BIT,
];

/// Whether `uid` names a storage SOP class we accept (not verification).
pub fn is_storage_sop_class(uid: &str) -> bool {
    let uid = uid.trim_end_matches('\0');
    uid != uids::VERIFICATION && ABSTRACT_SYNTAXES.contains(&uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_is_not_storage() {
        assert!(!is_storage_sop_class(uids::VERIFICATION));
        assert!(is_storage_sop_class(uids::CT_IMAGE_STORAGE));
        assert!(is_storage_sop_class("1.2.840.10008.5.1.4.1.1.2\0"));
    }
}
