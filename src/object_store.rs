//! Filesystem store owning the raw DICOM instance files.
//!
//! Instances are staged under `<root>/.staging/<uuid>` while being received,
//! then moved atomically to their canonical path
//! `<root>/<patientIdHash>/<studyUid>/<seriesUid>/<sopUid>.dcm`.
//! The two leading hex characters of sha1(patient id) bound directory fan-out.

use camino::{Utf8Path, Utf8PathBuf};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use crate::error::StoreError;
use crate::types::{PatientIdRef, SeriesUidRef, SopUidRef, StorageKey, StorageKeyRef, StudyUidRef};

const STAGING_DIR: &str = ".staging";

pub struct ObjectStore {
    root: Utf8PathBuf,
    verify_digest_on_read: bool,
}

/// Where an instance belongs in the canonical layout.
pub struct LayoutHint<'a> {
    pub patient_id: &'a PatientIdRef,
    pub study_uid: &'a StudyUidRef,
    pub series_uid: &'a SeriesUidRef,
    pub sop_uid: &'a SopUidRef,
}

impl ObjectStore {
    pub fn open_root(
        root: impl Into<Utf8PathBuf>,
        verify_digest_on_read: bool,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        fs_err::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self {
            root,
            verify_digest_on_read,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Open a staging sink for an incoming instance.
    pub fn stage_new(&self) -> Result<StagedFile, StoreError> {
        let path = self
            .root
            .join(STAGING_DIR)
            .join(uuid::Uuid::new_v4().to_string());
        let file = fs_err::File::create(path.as_std_path())?;
        Ok(StagedFile {
            path,
            file: Some(file),
            persisted: false,
        })
    }

    /// Move a staged file to its canonical path and return the storage key.
    ///
    /// Rename is atomic on the same filesystem; if the staging directory and
    /// the final directory are on different devices, fall back to
    /// copy + fsync + rename, then unlink the source.
    pub fn finalize_at(
        &self,
        mut staged: StagedFile,
        hint: &LayoutHint<'_>,
    ) -> Result<StorageKey, StoreError> {
        staged.close()?;
        let key = canonical_key(hint);
        let dest = self.path_of(key.as_ref());
        if let Some(parent) = dest.parent() {
            fs_err::create_dir_all(parent.as_std_path())?;
        }
        match fs_err::rename(staged.path.as_std_path(), dest.as_std_path()) {
            Ok(()) => {}
            Err(_) => move_across_devices(&staged.path, &dest)?,
        }
        staged.persisted = true;
        Ok(key)
    }

    /// Open a stored instance for reading.
    pub fn open(&self, key: &StorageKeyRef) -> Result<fs_err::File, StoreError> {
        let path = self.path_of(key);
        fs_err::File::open(path.as_std_path()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })
    }

    /// Whether reads should verify the recorded digest.
    pub fn verify_digest_on_read(&self) -> bool {
        self.verify_digest_on_read
    }

    /// Read a stored instance fully into memory.
    pub fn read(&self, key: &StorageKeyRef) -> Result<Vec<u8>, StoreError> {
        let mut file = self.open(key)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Read a stored instance and check its content hash against the digest
    /// recorded in the metadata index. A mismatch yields
    /// [StoreError::CorruptArtifact].
    pub fn read_verified(
        &self,
        key: &StorageKeyRef,
        expected_sha256: &str,
    ) -> Result<Vec<u8>, StoreError> {
        let buf = self.read(key)?;
        if sha256_hex(&buf) != expected_sha256 {
            return Err(StoreError::CorruptArtifact {
                key: key.to_string(),
            });
        }
        Ok(buf)
    }

    /// Delete a stored instance. Missing objects are not an error.
    pub fn remove(&self, key: &StorageKeyRef) -> Result<(), StoreError> {
        match fs_err::remove_file(self.path_of(key).as_std_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn path_of(&self, key: &StorageKeyRef) -> Utf8PathBuf {
        self.root.join(key.as_str())
    }
}

/// A staging sink being written by the SCP.
///
/// The staged file is deleted on drop unless it was finalized, so an aborted
/// association leaves nothing behind.
pub struct StagedFile {
    path: Utf8PathBuf,
    file: Option<fs_err::File>,
    persisted: bool,
}

impl StagedFile {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Flush buffered bytes so the staged file can be re-opened for parsing.
    pub fn flush_writes(&mut self) -> Result<(), StoreError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::other("staged file already closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        self.file.take();
        if !self.persisted {
            let _ = fs_err::remove_file(self.path.as_std_path());
        }
    }
}

/// The canonical storage key for an instance: a pure function of its
/// identifiers, so it can be recorded in the index before the file moves.
pub fn canonical_key(hint: &LayoutHint<'_>) -> StorageKey {
    StorageKey::from(format!(
        "{}/{}/{}/{}.dcm",
        patient_fanout(hint.patient_id),
        hint.study_uid,
        hint.series_uid,
        hint.sop_uid,
    ))
}

/// Fan-out directory for a patient: first two hex chars of sha1(patient id).
pub fn patient_fanout(patient_id: &PatientIdRef) -> String {
    let digest = Sha1::digest(patient_id.as_str().as_bytes());
    format!("{:02x}", digest[0])
}

/// Hex-encoded sha256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_string(&hasher.finalize())
}

/// Streaming sha256 of a file, returning the hex digest and the byte count.
pub fn sha256_hex_of_file(path: &Utf8Path) -> std::io::Result<(String, u64)> {
    let mut file = fs_err::File::open(path.as_std_path())?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex_string(&hasher.finalize()), total))
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn move_across_devices(src: &Utf8Path, dest: &Utf8Path) -> Result<(), StoreError> {
    let tmp = dest.with_extension("part");
    {
        let mut from = fs_err::File::open(src.as_std_path())?;
        let mut to = fs_err::File::create(tmp.as_std_path())?;
        std::io::copy(&mut from, &mut to)?;
        to.sync_all()?;
    }
    fs_err::rename(tmp.as_std_path(), dest.as_std_path())?;
    fs_err::remove_file(src.as_std_path())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PatientId, SeriesUid, SopUid, StudyUid};
    use rstest::*;

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = ObjectStore::open_root(root, false).unwrap();
        (dir, store)
    }

    fn hint<'a>(
        patient: &'a PatientId,
        study: &'a StudyUid,
        series: &'a SeriesUid,
        sop: &'a SopUid,
    ) -> LayoutHint<'a> {
        LayoutHint {
            patient_id: patient,
            study_uid: study,
            series_uid: series,
            sop_uid: sop,
        }
    }

    #[test]
    fn test_stage_finalize_open_roundtrip() {
        let (_dir, store) = store();
        let mut staged = store.stage_new().unwrap();
        staged.write_all(b"not really dicom").unwrap();

        let patient = PatientId::from("P001");
        let study = StudyUid::from("1.2.3");
        let series = SeriesUid::from("1.2.3.4");
        let sop = SopUid::from("1.2.3.4.5");
        let key = store
            .finalize_at(staged, &hint(&patient, &study, &series, &sop))
            .unwrap();

        assert!(key.as_str().ends_with("/1.2.3/1.2.3.4/1.2.3.4.5.dcm"));
        let bytes = store.read(&key).unwrap();
        assert_eq!(bytes, b"not really dicom");
    }

    #[test]
    fn test_fanout_is_sha1_prefix() {
        let patient = PatientId::from("P001");
        let fanout = patient_fanout(&patient);
        assert_eq!(fanout.len(), 2);
        assert!(fanout.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_digest_mismatch_is_corrupt() {
        let (_dir, store) = store();
        let mut staged = store.stage_new().unwrap();
        staged.write_all(b"payload").unwrap();
        let patient = PatientId::from("P002");
        let study = StudyUid::from("1.2");
        let series = SeriesUid::from("1.2.1");
        let sop = SopUid::from("1.2.1.1");
        let key = store
            .finalize_at(staged, &hint(&patient, &study, &series, &sop))
            .unwrap();

        let err = store.read_verified(&key, "00ff").unwrap_err();
        assert!(matches!(err, StoreError::CorruptArtifact { .. }));

        let good = sha256_hex(b"payload");
        assert!(store.read_verified(&key, &good).is_ok());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_dir, store) = store();
        let key = StorageKey::from("ab/1/2/3.dcm");
        store.remove(&key).unwrap();
        store.remove(&key).unwrap();
    }

    #[test]
    fn test_dropped_staging_file_is_deleted() {
        let (_dir, store) = store();
        let path = {
            let mut staged = store.stage_new().unwrap();
            staged.write_all(b"partial").unwrap();
            staged.path().to_owned()
        };
        assert!(!path.as_std_path().exists());
    }

    #[rstest]
    #[case(b"", "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")]
    #[case(b"abc", "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")]
    fn test_sha256_hex(#[case] data: &[u8], #[case] expected: &str) {
        assert_eq!(sha256_hex(data), expected);
    }
}
