//! Error categories shared by the SCP, the metadata index and the delivery API.

/// Stable error kinds used in API envelopes and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Conflict,
    RateLimited,
    CorruptArtifact,
    DicomReject,
    ProcessingFailure,
    Timeout,
    Unavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::CorruptArtifact => "CorruptArtifact",
            ErrorKind::DicomReject => "DicomReject",
            ErrorKind::ProcessingFailure => "ProcessingFailure",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Unavailable => "Unavailable",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::BadRequest => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::CorruptArtifact => 500,
            ErrorKind::DicomReject => 500,
            ErrorKind::ProcessingFailure => 500,
            ErrorKind::Timeout => 503,
            ErrorKind::Unavailable => 503,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("DICOM dataset does not have the required tag: \"{0}\"")]
pub struct MissingRequiredTag(pub &'static str);

/// Errors produced by the metadata index.
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("unknown {entity} \"{uid}\"")]
    NotFound { entity: &'static str, uid: String },

    #[error("{0}")]
    Conflict(String),

    #[error("metadata index unavailable")]
    Unavailable(#[source] sqlx::Error),
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::NotFound { .. } => ErrorKind::NotFound,
            IndexError::Conflict(_) => ErrorKind::Conflict,
            IndexError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Whether retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Unavailable(_))
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(e: sqlx::Error) -> Self {
        IndexError::Unavailable(e)
    }
}

/// Errors produced by the object store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("no stored object at \"{key}\"")]
    NotFound { key: String },

    #[error("stored object at \"{key}\" failed digest verification")]
    CorruptArtifact { key: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::CorruptArtifact,
            StoreError::CorruptArtifact { .. } => ErrorKind::CorruptArtifact,
            StoreError::Io(_) => ErrorKind::ProcessingFailure,
        }
    }
}

/// Errors produced while rendering pixel data.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("could not decode pixel data: {0}")]
    Decode(String),

    #[error("unsupported pixel layout: {0}")]
    Unsupported(&'static str),

    #[error("could not encode image: {0}")]
    Encode(String),
}

impl RenderError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ProcessingFailure
    }
}

/// Errors raised by the per-instance ingest pipeline.
///
/// Each variant maps onto the DICOM status byte reported to the SCU.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    MissingTag(#[from] MissingRequiredTag),

    #[error("dataset could not be read: {0}")]
    Unreadable(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// The DIMSE status code for the C-STORE-RSP.
    ///
    /// 0xC000 "Cannot Understand" for malformed datasets,
    /// 0xC001 "Processing Failure" for everything else.
    pub fn dicom_status(&self) -> u16 {
        match self {
            IngestError::MissingTag(_) | IngestError::Unreadable(_) => 0xC000,
            _ => 0xC001,
        }
    }
}
