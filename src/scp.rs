//! Handles incoming DICOM associations: negotiation, C-ECHO and C-STORE.
//!
//! Incoming datasets are streamed fragment by fragment into an object-store
//! staging file, so no association holds more than one PDU plus the parsed
//! dataset in memory. The ingest pipeline runs synchronously before the
//! C-STORE response goes out, which is what makes a success status mean
//! "durable on our side" to the SCU.

use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject, StandardDataDictionary};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::server::{AccessControl, ServerAssociationOptions};
use dicom::ul::pdu::{AssociationRJServiceUserReason, PDataValueType, UserIdentity};
use dicom::ul::Pdu;

use crate::association_error::AssociationError::{self, *};
use crate::error::{IngestError, MissingRequiredTag};
use crate::ingest::{ingest_instance, record_event, AssociationPeer, IngestContext};
use crate::metadata_index::IngestResult;
use crate::object_store::StagedFile;
use crate::transfer::{ABSTRACT_SYNTAXES, TRANSFER_SYNTAXES};
use crate::types::{ClientAETitle, OurAETitle};

/// Wire-level options of the store SCP.
#[derive(Debug, Clone)]
pub struct ScpConfig {
    pub aet: OurAETitle,
    /// Whether receiving PDUs must not surpass the negotiated maximum PDU length.
    pub strict: bool,
    pub max_pdu_length: u32,
    /// Longest tolerated gap between PDUs.
    pub idle_timeout: Duration,
    /// Upper bound on the whole association; expiry causes an A-ABORT.
    pub total_timeout: Option<Duration>,
    /// Calling AE titles allowed to store. Empty accepts all.
    pub allowed_calling_ae_titles: Arc<Vec<ClientAETitle>>,
}

/// Access control: the called AE title must be ours and, when an allow list
/// is configured, the calling AE title must be on it. A rejected peer is
/// remembered so the listener can log the event.
#[derive(Clone)]
struct CallerAllowList {
    allowed: Arc<Vec<ClientAETitle>>,
    rejected: Arc<Mutex<Option<ClientAETitle>>>,
}

impl AccessControl for CallerAllowList {
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if called_ae_title != this_ae_title {
            *self.rejected.lock().unwrap() = Some(ClientAETitle::from(calling_ae_title));
            return Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized);
        }
        if !self.allowed.is_empty()
            && !self
                .allowed
                .iter()
                .any(|ae| ae.as_str() == calling_ae_title)
        {
            *self.rejected.lock().unwrap() = Some(ClientAETitle::from(calling_ae_title));
            return Err(AssociationRJServiceUserReason::CallingAETitleNotRecognized);
        }
        Ok(())
    }
}

/// Access control used when the association cap is reached.
struct RejectBusy;

impl AccessControl for RejectBusy {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Err(AssociationRJServiceUserReason::NoReasonGiven)
    }
}

/// Run the negotiation far enough to answer an Association Reject with
/// reason "no reason given", for connections over the association cap.
pub fn reject_over_capacity(scu_stream: TcpStream, config: &ScpConfig) {
    let _ = scu_stream.set_read_timeout(Some(config.idle_timeout));
    let options = ServerAssociationOptions::new()
        .ae_access_control(RejectBusy)
        .ae_title(config.aet.to_string())
        .max_pdu_length(config.max_pdu_length);
    if let Err(e) = options.establish(scu_stream) {
        // The reject PDU is the expected outcome here.
        tracing::debug!(event = "association_rejected_busy", detail = e.to_string());
    }
}

/// Serve one association until release, abort, or error.
pub fn handle_association(
    scu_stream: TcpStream,
    config: &ScpConfig,
    ctx: &IngestContext,
    rt: &tokio::runtime::Handle,
) -> Result<(), AssociationError> {
    let peer_addr = scu_stream.peer_addr().ok().map(|a| a.to_string());
    // The idle timeout between PDUs is enforced at the socket.
    let _ = scu_stream.set_read_timeout(Some(config.idle_timeout));
    let rejected = Arc::new(Mutex::new(None));

    let mut options = ServerAssociationOptions::new()
        .ae_access_control(CallerAllowList {
            allowed: Arc::clone(&config.allowed_calling_ae_titles),
            rejected: Arc::clone(&rejected),
        })
        .ae_title(config.aet.to_string())
        .strict(config.strict)
        .max_pdu_length(config.max_pdu_length);
    for ts in TRANSFER_SYNTAXES {
        options = options.with_transfer_syntax(*ts);
    }
    for uid in ABSTRACT_SYNTAXES {
        options = options.with_abstract_syntax(*uid);
    }

    let mut association = match options.establish(scu_stream) {
        Ok(association) => association,
        Err(e) => {
            if let Some(aec) = rejected.lock().unwrap().take() {
                let peer = AssociationPeer {
                    aec,
                    peer_addr,
                };
                rt.block_on(record_event(
                    ctx,
                    &peer,
                    IngestResult::Rejected,
                    Some("unknown_ae_title".to_string()),
                    None,
                ));
                return Err(PeerRejected("unknown AE title"));
            }
            return Err(CouldNotEstablish(e));
        }
    };

    let peer = AssociationPeer {
        aec: ClientAETitle::from(association.client_ae_title().trim()),
        peer_addr,
    };
    tracing::info!(event = "association_open", aec = peer.aec.as_str());

    let mut msgid: u16 = 1;
    let mut sop_class_uid = String::new();
    let mut sop_instance_uid = String::new();
    // Dataset fragments stream into object-store staging, not memory.
    let mut staged: Option<StagedFile> = None;
    let opened_at = std::time::Instant::now();

    loop {
        if let Some(total) = config.total_timeout {
            if opened_at.elapsed() > total {
                tracing::warn!(event = "association_total_timeout", aec = peer.aec.as_str());
                let _ = association.send(&Pdu::AbortRQ {
                    source: dicom::ul::pdu::AbortRQSource::ServiceUser,
                });
                break;
            }
        }
        match association.receive() {
            Ok(Pdu::PData { mut data }) => {
                for data_value in &mut data {
                    match (data_value.value_type.clone(), data_value.is_last) {
                        (PDataValueType::Data, false) => {
                            append_fragment(ctx, &mut staged, &data_value.data)?;
                        }
                        (PDataValueType::Command, true) => {
                            // Commands are always in implicit VR LE.
                            let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN
                                .erased();
                            let obj = InMemDicomObject::read_dataset_with_ts(
                                data_value.data.as_slice(),
                                &ts,
                            )
                            .map_err(FailedToReadCommand)?;
                            let command_field = obj
                                .element(tags::COMMAND_FIELD)
                                .map_err(|_| MissingTag(tags::COMMAND_FIELD))?
                                .uint16()
                                .map_err(|_| InvalidNumber(tags::COMMAND_FIELD))?;
                            if command_field == 0x0030 {
                                // C-ECHO-RQ
                                let echo_msgid = obj
                                    .element(tags::MESSAGE_ID)
                                    .map_err(|_| MissingTag(tags::MESSAGE_ID))?
                                    .to_int()
                                    .map_err(|_| InvalidNumber(tags::MESSAGE_ID))?;
                                let rsp = command_pdu(
                                    data_value.presentation_context_id,
                                    &create_cecho_response(echo_msgid),
                                )?;
                                association
                                    .send(&rsp)
                                    .map_err(|_| CannotRespond("failed to send C-ECHO response"))?;
                            } else {
                                msgid = obj
                                    .element(tags::MESSAGE_ID)
                                    .map_err(|_| MissingTag(tags::MESSAGE_ID))?
                                    .to_int()
                                    .map_err(|_| InvalidNumber(tags::MESSAGE_ID))?;
                                sop_class_uid = obj
                                    .element(tags::AFFECTED_SOP_CLASS_UID)
                                    .map_err(|_| MissingTag(tags::AFFECTED_SOP_CLASS_UID))?
                                    .to_str()
                                    .map_err(|_| CouldNotRetrieve(tags::AFFECTED_SOP_CLASS_UID))?
                                    .to_string();
                                sop_instance_uid = obj
                                    .element(tags::AFFECTED_SOP_INSTANCE_UID)
                                    .map_err(|_| MissingTag(tags::AFFECTED_SOP_INSTANCE_UID))?
                                    .to_str()
                                    .map_err(|_| {
                                        CouldNotRetrieve(tags::AFFECTED_SOP_INSTANCE_UID)
                                    })?
                                    .to_string();
                                staged = None;
                            }
                        }
                        (PDataValueType::Command, false) => {
                            // DIMSE commands fit a single PDV.
                        }
                        (PDataValueType::Data, true) => {
                            append_fragment(ctx, &mut staged, &data_value.data)?;
                            let transfer_syntax = association
                                .presentation_contexts()
                                .iter()
                                .find(|pc| pc.id == data_value.presentation_context_id)
                                .ok_or(MissingPresentationContext)?
                                .transfer_syntax
                                .clone();
                            let complete = staged.take().ok_or(MissingPresentationContext)?;
                            let status = receive_instance(
                                ctx,
                                rt,
                                complete,
                                &transfer_syntax,
                                &peer,
                            )?;
                            let rsp = command_pdu(
                                data_value.presentation_context_id,
                                &create_cstore_response(
                                    msgid,
                                    &sop_class_uid,
                                    &sop_instance_uid,
                                    status,
                                ),
                            )?;
                            association
                                .send(&rsp)
                                .map_err(|_| CannotRespond("failed to send C-STORE response"))?;
                        }
                    }
                }
            }
            Ok(Pdu::ReleaseRQ) => {
                association.send(&Pdu::ReleaseRP).unwrap_or_else(|e| {
                    tracing::warn!(
                        event = "release_response_failed",
                        error = e.to_string(),
                    );
                });
                tracing::info!(event = "association_released", aec = peer.aec.as_str());
                break;
            }
            Ok(Pdu::AbortRQ { source }) => {
                // Any partially staged file is removed when `staged` drops.
                tracing::warn!(event = "association_aborted", source = format!("{source:?}"));
                break;
            }
            Ok(_) => {}
            Err(e @ dicom::ul::association::server::Error::Receive { .. }) => {
                tracing::debug!(event = "association_closed", detail = e.to_string());
                break;
            }
            Err(e) => {
                tracing::warn!(event = "association_error", error = e.to_string());
                break;
            }
        }
    }
    Ok(())
}

fn append_fragment(
    ctx: &IngestContext,
    staged: &mut Option<StagedFile>,
    bytes: &[u8],
) -> Result<(), AssociationError> {
    let sink = match staged {
        Some(sink) => sink,
        None => staged.insert(ctx.store.stage_new()?),
    };
    sink.write_all(bytes)?;
    Ok(())
}

/// Parse the staged dataset and run it through ingest, returning the DIMSE
/// status for the C-STORE response. Per-instance failures stay on this
/// association; only wire-level problems propagate.
fn receive_instance(
    ctx: &IngestContext,
    rt: &tokio::runtime::Handle,
    mut staged: StagedFile,
    transfer_syntax: &str,
    peer: &AssociationPeer,
) -> Result<u16, AssociationError> {
    staged.flush_writes()?;
    let ts_uid = transfer_syntax.trim_end_matches(['\0', ' ']);
    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .ok_or_else(|| UnknownTransferSyntax(ts_uid.to_string()))?;
    let reader = BufReader::new(fs_err::File::open(staged.path().as_std_path())?);
    let obj = match InMemDicomObject::read_dataset_with_ts(reader, ts) {
        Ok(obj) => obj,
        Err(e) => {
            let err = IngestError::Unreadable(e.to_string());
            let status = err.dicom_status();
            tracing::warn!(event = "unreadable_dataset", error = e.to_string());
            rt.block_on(record_event(
                ctx,
                peer,
                IngestResult::Rejected,
                Some(err.to_string()),
                None,
            ));
            return Ok(status);
        }
    };

    let file_obj = match build_file_object(obj, ts_uid) {
        Ok(file_obj) => file_obj,
        Err(e) => {
            let err = IngestError::from(e);
            tracing::warn!(event = "rejected_dataset", error = err.to_string());
            rt.block_on(record_event(
                ctx,
                peer,
                IngestResult::Rejected,
                Some(err.to_string()),
                None,
            ));
            return Ok(err.dicom_status());
        }
    };

    match rt.block_on(ingest_instance(ctx, file_obj, peer)) {
        Ok(_) => Ok(0x0000),
        Err(e) => {
            tracing::error!(event = "ingest_failed", error = e.to_string());
            Ok(e.dicom_status())
        }
    }
}

fn build_file_object(
    obj: InMemDicomObject<StandardDataDictionary>,
    transfer_syntax: &str,
) -> Result<dicom::object::DefaultDicomObject, MissingRequiredTag> {
    let sop_class_uid = obj
        .element(tags::SOP_CLASS_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .ok_or(MissingRequiredTag("SOPClassUID"))?
        .to_string();
    let sop_instance_uid = obj
        .element(tags::SOP_INSTANCE_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .ok_or(MissingRequiredTag("SOPInstanceUID"))?
        .to_string();
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(transfer_syntax)
        .build()
        .map_err(|_| MissingRequiredTag("TransferSyntaxUID"))?;
    Ok(obj.with_exact_meta(meta))
}

fn command_pdu(
    presentation_context_id: u8,
    command: &InMemDicomObject<StandardDataDictionary>,
) -> Result<Pdu, AssociationError> {
    // Commands are always in implicit VR LE.
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(&mut data, &ts)
        .map_err(|_| CannotRespond("could not write response object"))?;
    Ok(Pdu::PData {
        data: vec![dicom::ul::pdu::PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    })
}

fn create_cstore_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

fn create_cecho_response(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
    ])
}
