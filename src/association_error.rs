use dicom::core::Tag;
use dicom::dictionary_std::StandardDataDictionary;

use crate::error::StoreError;

/// Error which might happen while serving a DICOM association.
#[derive(thiserror::Error, Debug)]
pub(crate) enum AssociationError {
    #[error("Could not establish association.")]
    CouldNotEstablish(dicom::ul::association::server::Error),

    #[error("Association rejected: {0}")]
    PeerRejected(&'static str),

    #[error("Failed to read incoming DICOM command")]
    FailedToReadCommand(dicom::object::ReadError),

    #[error("{0}")]
    CannotRespond(&'static str),

    #[error("Missing {}", name_of(.0))]
    MissingTag(Tag),

    #[error("Value for {} is not a number", name_of(.0))]
    InvalidNumber(Tag),

    #[error("Could not retrieve {}", name_of(.0))]
    CouldNotRetrieve(Tag),

    #[error("Missing presentation context")]
    MissingPresentationContext,

    #[error("Unsupported transfer syntax \"{0}\"")]
    UnknownTransferSyntax(String),

    #[error("Could not stage incoming instance")]
    Staging(#[from] StoreError),

    #[error("Could not buffer incoming instance")]
    Buffering(#[from] std::io::Error),
}

pub(crate) fn name_of(tag: &Tag) -> &'static str {
    use dicom::core::DataDictionary;
    StandardDataDictionary
        .by_tag(*tag)
        .map(|e| e.alias)
        .unwrap_or("unknown tag")
}
