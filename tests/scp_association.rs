//! Wire-level tests: a real SCU association against the running listener.

mod util;

use std::net::SocketAddr;
use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{InMemDicomObject, StandardDataDictionary};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::client::ClientAssociationOptions;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use dicom::encoding::TransferSyntaxIndex;

use noctis::settings::{
    IdsSettings, IndexSettings, LogSettings, NoctisEnvOptions, ScpSettings, StoreSettings,
};
use noctis::types::{SeriesUid, SopUid};
use noctis::{run_everything, MetadataIndex, RunningServices};

fn test_options(dir: &std::path::Path) -> NoctisEnvOptions {
    NoctisEnvOptions {
        scp: ScpSettings {
            aet: noctis::types::OurAETitle::from("STORE_SCP"),
            port: 0,
            strict: false,
        },
        scp_max_associations: 16,
        scp_max_pdu_length: 16384,
        scp_allowed_calling_ae_titles: "TESTSCU".to_string(),
        scp_listener_threads: NonZeroUsize::new(2).unwrap(),
        scp_idle_timeout: Duration::from_secs(10),
        scp_total_timeout: None,
        store: StoreSettings {
            root: camino::Utf8PathBuf::from_path_buf(dir.join("store")).unwrap(),
        },
        store_verify_digest_on_read: false,
        index: IndexSettings {
            url: util::index_url(dir),
        },
        index_max_conns: NonZeroU32::new(2).unwrap(),
        ids: IdsSettings {
            bind: "127.0.0.1:0".to_string(),
        },
        ids_base_path: "/api/v1/dicom".to_string(),
        ids_render_workers: Some(NonZeroUsize::new(2).unwrap()),
        ids_rate_limit_requests: 1000,
        ids_rate_limit_window_seconds: 60,
        ids_cache_l1_bytes: 8 * 1024 * 1024,
        ids_cache_l2_url: None,
        ids_cache_image_ttl_seconds: 60,
        ids_request_timeout: Duration::from_secs(30),
        log: LogSettings::default(),
    }
}

fn scp_addr(services: &RunningServices) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], services.scp_addr.port()))
}

fn command_status(pdu: Pdu) -> u16 {
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    match pdu {
        Pdu::PData { data } => {
            let obj = InMemDicomObject::read_dataset_with_ts(data[0].data.as_slice(), &ts)
                .expect("response command must parse");
            obj.element(tags::STATUS).unwrap().to_int::<u16>().unwrap()
        }
        other => panic!("expected PData response, got {other:?}"),
    }
}

fn echo_scu(addr: SocketAddr) -> u16 {
    let mut scu = ClientAssociationOptions::new()
        .calling_ae_title("TESTSCU")
        .with_abstract_syntax(uids::VERIFICATION)
        .establish_with(&format!("STORE_SCP@{addr}"))
        .expect("echo association must establish");
    let pc = scu.presentation_contexts()[0].clone();

    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let cmd: InMemDicomObject<StandardDataDictionary> =
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, uids::VERIFICATION),
            ),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0030])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [1])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [0x0101]),
            ),
        ]);
    let mut cmd_data = Vec::new();
    cmd.write_dataset_with_ts(&mut cmd_data, &ts).unwrap();
    scu.send(&Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc.id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: cmd_data,
        }],
    })
    .unwrap();
    let status = command_status(scu.receive().unwrap());
    let _ = scu.release();
    status
}

fn store_scu(addr: SocketAddr, dataset: &InMemDicomObject) -> u16 {
    let mut scu = ClientAssociationOptions::new()
        .calling_ae_title("TESTSCU")
        .with_presentation_context(uids::CT_IMAGE_STORAGE, vec![uids::EXPLICIT_VR_LITTLE_ENDIAN])
        .establish_with(&format!("STORE_SCP@{addr}"))
        .expect("store association must establish");
    let pc = scu.presentation_contexts()[0].clone();

    let sop_uid = dataset
        .element(tags::SOP_INSTANCE_UID)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let implicit = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let cmd: InMemDicomObject<StandardDataDictionary> =
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, uids::CT_IMAGE_STORAGE),
            ),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [2])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [0x0000]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, sop_uid.as_str()),
            ),
        ]);
    let mut cmd_data = Vec::new();
    cmd.write_dataset_with_ts(&mut cmd_data, &implicit).unwrap();

    let ts = TransferSyntaxRegistry
        .get(&pc.transfer_syntax)
        .expect("negotiated transfer syntax must be known");
    let mut object_data = Vec::new();
    dataset.write_dataset_with_ts(&mut object_data, ts).unwrap();

    scu.send(&Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            },
            PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: object_data,
            },
        ],
    })
    .unwrap();
    let status = command_status(scu.receive().unwrap());
    let _ = scu.release();
    status
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_store_duplicate_and_unknown_ae() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(dir.path());
    let index_url = util::index_url(dir.path());

    let (tx, rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(run_everything(options, Some(4), Some(tx)));
    let services = rx.await.unwrap();
    let addr = scp_addr(&services);

    // 1. C-ECHO succeeds.
    let echo_status = tokio::task::spawn_blocking(move || echo_scu(addr))
        .await
        .unwrap();
    assert_eq!(echo_status, 0x0000);

    // 2. C-STORE succeeds.
    let store_status = tokio::task::spawn_blocking(move || {
        store_scu(addr, &util::ct_dataset("1.2.840.77", 8, 8))
    })
    .await
    .unwrap();
    assert_eq!(store_status, 0x0000);

    // 3. Re-sending the same SOP instance succeeds and is ignored.
    let dup_status = tokio::task::spawn_blocking(move || {
        store_scu(addr, &util::ct_dataset("1.2.840.77", 8, 8))
    })
    .await
    .unwrap();
    assert_eq!(dup_status, 0x0000);

    // 4. A calling AE title outside the allow list is rejected at negotiation.
    let rejected = tokio::task::spawn_blocking(move || {
        ClientAssociationOptions::new()
            .calling_ae_title("BAD")
            .with_abstract_syntax(uids::VERIFICATION)
            .establish_with(&format!("STORE_SCP@{addr}"))
            .map(|_| ())
    })
    .await
    .unwrap();
    assert!(rejected.is_err());

    server.await.unwrap().unwrap();

    // One instance row; the events tell the whole story.
    let index = MetadataIndex::connect(&index_url, 1).await.unwrap();
    let instances = index
        .list_instances(&SeriesUid::from(util::SERIES_UID))
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);

    let full = index.get_instance(&SopUid::from("1.2.840.77")).await.unwrap();
    assert_eq!(full.rows, 8);
    assert!(full.file_size > 0);

    let events = index.list_events(None, 10).await.unwrap();
    let results: Vec<_> = events.iter().map(|e| e.result.as_str()).collect();
    assert_eq!(results, vec!["stored", "duplicate_ignored", "rejected"]);
    assert_eq!(
        events[2].reject_reason.as_deref(),
        Some("unknown_ae_title")
    );
    assert_eq!(events[2].calling_aet.as_str(), "BAD");
}
