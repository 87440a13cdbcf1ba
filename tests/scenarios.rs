use anyhow::Context;
use process_notary::attachment::{Attachment, FsBlobStore, MemoryBlobStore, Upload};
use process_notary::authz::{AllowAll, Authorizer, AuthzInput, Decision, RoleAuthorizer};
use process_notary::canonical::to_canonical_string;
use process_notary::normalize::Submission;
use process_notary::process::{Notarization, Process, ProcessDpp, ProcessStatus, ProcessStep};
use process_notary::sequence::{SubstepState, is_process_done};
use process_notary::sled_store::SledStore;
use process_notary::store::{MemoryStore, Store};
use process_notary::types::{Actor, ProcessId};
use process_notary::workflow::Workflow;
use process_notary::{Completion, NotaryError, NotaryResult, ProcessService};
use std::io::Read;
use std::sync::Arc;

use tempfile::tempdir; // Use for test db cleanup.

const BOTTLING: &str = r#"
name: Bottling
description: Fill, label and release one batch
steps:
  - step_id: line
    title: Bottling line
    order: 1
    organization: plant-7
    substeps:
      - { substep_id: fill, title: Fill volume, order: 1, roles: [ops], input_key: litres, input_type: number }
      - { substep_id: label, title: Label batch, order: 2, roles: [ops], input_key: lot, input_type: string }
      - { substep_id: release, title: Release, order: 3, roles: [ops, qa], input_key: released_by, input_type: string }
dpp:
  enabled: true
  gtin: "9506000134352"
  lot_input_key: lot
"#;

const CERTIFICATE: &str = r#"
name: Certificate
steps:
  - step_id: docs
    title: Documents
    order: 1
    substeps:
      - { substep_id: upload, title: Upload certificate, order: 1, roles: [ops], input_key: certificate, input_type: file }
"#;

fn ops() -> Actor {
    Actor::new("alice", "ops", vec!["ops".into()])
}

fn text(value: &str) -> Submission<&'static [u8]> {
    Submission::Text(value.to_string())
}

fn memory_service(authorizer: Arc<dyn Authorizer>, max_bytes: u64) -> (ProcessService, MemoryBlobStore) {
    let blobs = MemoryBlobStore::new();
    let service = ProcessService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(blobs.clone()),
        authorizer,
        max_bytes,
    );
    (service, blobs)
}

#[test]
fn three_substeps_end_to_end() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("bottling", BOTTLING)?;
    let (service, _) = memory_service(Arc::new(RoleAuthorizer), 1024);
    let process = service.start_process(&workflow)?;
    let pid = process.id;

    service
        .complete_substep(&workflow, &pid, "fill", &ops(), text("10"))
        .context("Failed on fill: ")?;

    let states: Vec<SubstepState> = service
        .availability(&workflow, &pid)?
        .into_iter()
        .map(|a| a.state)
        .collect();
    assert_eq!(
        states,
        vec![SubstepState::Done, SubstepState::Available, SubstepState::Locked]
    );

    // release before label is out of order
    let err = service
        .complete_substep(&workflow, &pid, "release", &ops(), text("alice"))
        .unwrap_err();
    assert!(matches!(err, NotaryError::SequenceViolation(ref s) if s == "release"));

    service.complete_substep(&workflow, &pid, "label", &ops(), text("LOT-7"))?;
    let done = service.complete_substep(&workflow, &pid, "release", &ops(), text("alice"))?;

    let process = done.process().clone();
    assert!(is_process_done(&workflow, &process));
    assert_eq!(process.status, ProcessStatus::Done);

    let export = service.export_notarized(&workflow, &pid)?;
    assert_eq!(export.status, ProcessStatus::Done);
    assert_eq!(export.merkle.leaves.len(), 3);
    let root = export.merkle.root.clone().context("root missing")?;
    assert_eq!(root.len(), 64);

    // same data, same root
    let again = service.export_merkle(&workflow, &pid)?;
    assert_eq!(again.root.as_deref(), Some(root.as_str()));
    assert_eq!(again, export.merkle);

    let json = serde_json::to_value(&export)?;
    assert_eq!(json["status"], "done");
    assert_eq!(
        serde_json::to_string(&json["steps"][0]["substeps"][0]["payload"])?,
        r#"{"litres":10}"#
    );
    assert_eq!(json["steps"][0]["substeps"][2]["role"], "ops,qa");

    Ok(())
}

#[test]
fn notarizations_carry_independent_payload_digests() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("bottling", BOTTLING)?;
    let (service, _) = memory_service(Arc::new(AllowAll), 1024);
    let pid = service.start_process(&workflow)?.id;

    service.complete_substep(&workflow, &pid, "fill", &ops(), text("12.5"))?;
    service.complete_substep(&workflow, &pid, "label", &ops(), text("LOT-1"))?;

    let log = service.notarizations(&pid)?;
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].substep_id, "fill");
    assert_eq!(log[0].digest, sha256::digest(r#"{"litres":12.5}"#));
    assert_eq!(log[1].digest, sha256::digest(r#"{"lot":"LOT-1"}"#));
    assert!(log.iter().all(|n| n.id.starts_with("ntz1")));

    let (hash, cbor) = log[0].build()?;
    assert_eq!(hash, sha256::digest(&cbor));
    Ok(())
}

#[test]
fn resubmitting_a_done_substep_writes_nothing() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("bottling", BOTTLING)?;
    let (service, _) = memory_service(Arc::new(RoleAuthorizer), 1024);
    let pid = service.start_process(&workflow)?.id;

    let first = service.complete_substep(&workflow, &pid, "fill", &ops(), text("10"))?;
    let second = service.complete_substep(&workflow, &pid, "fill", &ops(), text("99"))?;

    let Completion::AlreadyDone { step, .. } = second else {
        panic!("expected AlreadyDone, got {second:?}");
    };
    let Completion::Recorded { notarization, .. } = first else {
        panic!("expected Recorded");
    };
    assert_eq!(step.data.as_ref().map(|d| d.digest()), Some(notarization.digest));
    assert_eq!(service.notarizations(&pid)?.len(), 1);
    Ok(())
}

#[test]
fn resubmitting_without_permission_is_denied() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("bottling", BOTTLING)?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let with_policy = |authorizer: Arc<dyn Authorizer>| {
        ProcessService::new(
            Arc::clone(&store),
            Arc::new(MemoryBlobStore::new()),
            authorizer,
            1024,
        )
    };
    let service = with_policy(Arc::new(RoleAuthorizer));
    let pid = service.start_process(&workflow)?.id;
    service.complete_substep(&workflow, &pid, "fill", &ops(), text("10"))?;

    let nobody = Actor::new("mallory", "nobody", vec![]);
    let err = service
        .complete_substep(&workflow, &pid, "fill", &nobody, text("99"))
        .unwrap_err();
    assert!(matches!(err, NotaryError::AuthorizationDenied { ref substep_id, .. } if substep_id == "fill"));

    // unreachable policy is not bypassed by a done substep either
    let err = with_policy(Arc::new(Offline))
        .complete_substep(&workflow, &pid, "fill", &ops(), text("99"))
        .unwrap_err();
    assert!(matches!(err, NotaryError::AuthorizationUnavailable(_)));
    assert_eq!(service.notarizations(&pid)?.len(), 1);
    Ok(())
}

#[test]
fn authorization_outcomes() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("bottling", BOTTLING)?;
    let (service, _) = memory_service(Arc::new(RoleAuthorizer), 1024);
    let pid = service.start_process(&workflow)?.id;

    let qa = Actor::new("bob", "qa", vec!["qa".into()]);
    let err = service
        .complete_substep(&workflow, &pid, "fill", &qa, text("10"))
        .unwrap_err();
    assert!(matches!(err, NotaryError::AuthorizationDenied { .. }));

    // claims ops without holding it
    let impostor = Actor::new("mallory", "ops", vec!["qa".into()]);
    let err = service
        .complete_substep(&workflow, &pid, "fill", &impostor, text("10"))
        .unwrap_err();
    assert!(matches!(err, NotaryError::AuthorizationDenied { .. }));

    // out of order wins over an allowing policy
    let (open, _) = memory_service(Arc::new(AllowAll), 1024);
    let pid = open.start_process(&workflow)?.id;
    let err = open
        .complete_substep(&workflow, &pid, "label", &qa, text("LOT"))
        .unwrap_err();
    assert!(matches!(err, NotaryError::SequenceViolation(_)));
    Ok(())
}

struct Offline;

impl Authorizer for Offline {
    fn decide(&self, _: &AuthzInput<'_>) -> NotaryResult<Decision> {
        Err(NotaryError::store(anyhow::anyhow!("policy service timed out")))
    }
}

#[test]
fn unreachable_policy_halts_completion() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("bottling", BOTTLING)?;
    let (service, _) = memory_service(Arc::new(Offline), 1024);
    let pid = service.start_process(&workflow)?.id;

    let err = service
        .complete_substep(&workflow, &pid, "fill", &ops(), text("10"))
        .unwrap_err();
    assert!(matches!(err, NotaryError::AuthorizationUnavailable(ref m) if m.contains("timed out")));
    assert!(!service.load_process(&pid)?.is_step_done("fill"));
    Ok(())
}

#[test]
fn wrong_workflow_and_unknown_ids() -> anyhow::Result<()> {
    let bottling = Workflow::from_yaml("bottling", BOTTLING)?;
    let certificate = Workflow::from_yaml("certificate", CERTIFICATE)?;
    let (service, _) = memory_service(Arc::new(AllowAll), 1024);
    let pid = service.start_process(&bottling)?.id;

    let err = service.export_notarized(&certificate, &pid).unwrap_err();
    assert!(matches!(err, NotaryError::WorkflowMismatch { .. }));

    let err = service
        .complete_substep(&bottling, &pid, "nope", &ops(), text("1"))
        .unwrap_err();
    assert!(matches!(err, NotaryError::NotFound { kind: "substep", .. }));

    let err = service
        .load_process(&ProcessId::new())
        .unwrap_err();
    assert!(matches!(err, NotaryError::NotFound { kind: "process", .. }));
    Ok(())
}

#[test]
fn invalid_value_leaves_substep_open() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("bottling", BOTTLING)?;
    let (service, _) = memory_service(Arc::new(AllowAll), 1024);
    let pid = service.start_process(&workflow)?.id;

    let err = service
        .complete_substep(&workflow, &pid, "fill", &ops(), text("ten litres"))
        .unwrap_err();
    assert!(matches!(err, NotaryError::Validation(_)));
    assert!(service.notarizations(&pid)?.is_empty());
    Ok(())
}

#[test]
fn product_passport_is_generated_once_and_resolvable() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("bottling", BOTTLING)?;
    let (service, _) = memory_service(Arc::new(AllowAll), 1024);
    let pid = service.start_process(&workflow)?.id;

    service.complete_substep(&workflow, &pid, "fill", &ops(), text("10"))?;
    service.complete_substep(&workflow, &pid, "label", &ops(), text("LOT 7/B"))?;
    let before = service.load_process(&pid)?;
    assert!(before.dpp.is_none());

    service.complete_substep(&workflow, &pid, "release", &ops(), text("alice"))?;
    let dpp = service.load_process(&pid)?.dpp.context("dpp missing")?;
    assert_eq!(dpp.gtin, "09506000134352");
    assert_eq!(dpp.lot, "LOT 7/B");
    assert_eq!(dpp.serial, pid.to_hex());

    // ensure_dpp does not regenerate
    let again = service.ensure_dpp(&workflow, &pid)?;
    assert_eq!(again, dpp);

    let link = dpp.digital_link();
    assert!(link.starts_with("/01/09506000134352/10/LOT%207%2FB/21/"));
    let found = service.resolve_digital_link(&workflow, &link)?;
    assert_eq!(found.id, pid);

    let other = format!("/01/09506000134352/10/LOT-X/21/{}", pid.to_hex());
    assert!(matches!(
        service.resolve_digital_link(&workflow, &other),
        Err(NotaryError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn missing_lot_does_not_undo_completion() -> anyhow::Result<()> {
    let yaml = BOTTLING.replace("lot_input_key: lot", "lot_input_key: batch_code");
    let workflow = Workflow::from_yaml("bottling", &yaml)?;
    let (service, _) = memory_service(Arc::new(AllowAll), 1024);
    let pid = service.start_process(&workflow)?.id;

    for (substep, value) in [("fill", "1"), ("label", "L1"), ("release", "alice")] {
        service.complete_substep(&workflow, &pid, substep, &ops(), text(value))?;
    }

    let process = service.load_process(&pid)?;
    assert_eq!(process.status, ProcessStatus::Done);
    assert!(process.dpp.is_none());
    assert!(matches!(
        service.ensure_dpp(&workflow, &pid),
        Err(NotaryError::DppUnavailable(_))
    ));
    Ok(())
}

#[test]
fn oversized_upload_is_rejected_without_a_blob() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("certificate", CERTIFICATE)?;
    let (service, blobs) = memory_service(Arc::new(AllowAll), 16);
    let pid = service.start_process(&workflow)?.id;

    let big = vec![b'x'; 64];
    let upload = Upload {
        filename: "cert.txt".to_string(),
        content_type: Some("text/plain".to_string()),
        reader: big.as_slice(),
    };
    let err = service
        .complete_substep(&workflow, &pid, "upload", &ops(), Submission::File(upload))
        .unwrap_err();

    assert!(matches!(err, NotaryError::AttachmentTooLarge { max_bytes: 16 }));
    assert!(blobs.is_empty());
    assert!(!service.load_process(&pid)?.is_step_done("upload"));
    Ok(())
}

#[test]
fn uploaded_file_round_trips() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let workflow = Workflow::from_yaml("certificate", CERTIFICATE)?;
    let blobs = FsBlobStore::open(dir.path().join("blobs"))?;
    let service = ProcessService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(blobs),
        Arc::new(AllowAll),
        1024,
    );
    let pid = service.start_process(&workflow)?.id;

    let body = b"%PDF-1.4 certificate of origin";
    let upload = Upload {
        filename: "origin.pdf".to_string(),
        content_type: None,
        reader: &body[..],
    };
    let completion =
        service.complete_substep(&workflow, &pid, "upload", &ops(), Submission::File(upload))?;
    let payload = completion
        .process()
        .step("upload")
        .and_then(|s| s.data.clone())
        .context("payload missing")?;
    let reference = &payload["certificate"];
    assert_eq!(reference["sha256"], sha256::digest(&body[..]));
    assert_eq!(reference["content_type"], "application/pdf");

    let id = reference["attachment_id"].as_str().context("id missing")?;
    let (meta, mut reader) = service.open_attachment(id)?;
    let mut stored = Vec::new();
    reader.read_to_end(&mut stored)?;
    assert_eq!(stored, body);
    assert_eq!(meta.size, body.len() as u64);

    let export = service.export_notarized(&workflow, &pid)?;
    let shown = export.steps[0].substeps[0].attachment.clone().context("attachment missing")?;
    assert_eq!(shown.filename, "origin.pdf");
    Ok(())
}

#[test]
fn oversized_upload_leaves_blob_directory_empty() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let blob_dir = dir.path().join("blobs");
    let workflow = Workflow::from_yaml("certificate", CERTIFICATE)?;
    let service = ProcessService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(FsBlobStore::open(&blob_dir)?),
        Arc::new(AllowAll),
        8,
    );
    let pid = service.start_process(&workflow)?.id;

    let upload = Upload {
        filename: "big.bin".to_string(),
        content_type: Some("application/octet-stream".to_string()),
        reader: &[0u8; 4096][..],
    };
    let err = service
        .complete_substep(&workflow, &pid, "upload", &ops(), Submission::File(upload))
        .unwrap_err();
    assert!(matches!(err, NotaryError::AttachmentTooLarge { .. }));
    assert_eq!(std::fs::read_dir(&blob_dir)?.count(), 0);
    Ok(())
}

const INSPECTION: &str = r#"
name: Inspection
steps:
  - step_id: qa
    title: Quality
    order: 1
    substeps:
      - substep_id: inspect
        title: Inspect batch
        order: 1
        roles: [qa]
        input_key: report
        input_type: structured
        schema: { type: object }
"#;

fn qa() -> Actor {
    Actor::new("bob", "qa", vec!["qa".into()])
}

#[test]
fn oversized_data_url_rolls_back_earlier_attachments() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("inspection", INSPECTION)?;
    let (service, blobs) = memory_service(Arc::new(RoleAuthorizer), 8);
    let pid = service.start_process(&workflow)?.id;

    let report = r#"{"a":"data:,abc","b":"data:,0123456789abcdef"}"#;
    let err = service
        .complete_substep(&workflow, &pid, "inspect", &qa(), text(report))
        .unwrap_err();

    assert!(matches!(err, NotaryError::AttachmentTooLarge { max_bytes: 8 }));
    assert!(blobs.is_empty());
    assert!(!service.load_process(&pid)?.is_step_done("inspect"));
    assert!(service.notarizations(&pid)?.is_empty());

    // within the limit the same shape goes through
    let report = r#"{"a":"data:,abc","b":"data:,def"}"#;
    service.complete_substep(&workflow, &pid, "inspect", &qa(), text(report))?;
    assert_eq!(blobs.len(), 2);
    Ok(())
}

/// Memory store whose progress writes always fail.
struct ProgressFails(MemoryStore);

impl Store for ProgressFails {
    fn create_process(&self, process: &Process) -> NotaryResult<()> {
        self.0.create_process(process)
    }
    fn load_process(&self, id: &ProcessId) -> NotaryResult<Process> {
        self.0.load_process(id)
    }
    fn list_processes(&self, workflow_key: &str) -> NotaryResult<Vec<Process>> {
        self.0.list_processes(workflow_key)
    }
    fn update_progress(&self, _: &ProcessId, _: &str, _: &ProcessStep) -> NotaryResult<()> {
        Err(NotaryError::store(anyhow::anyhow!("disk full")))
    }
    fn update_status(&self, id: &ProcessId, status: ProcessStatus) -> NotaryResult<()> {
        self.0.update_status(id, status)
    }
    fn set_dpp(&self, id: &ProcessId, dpp: &ProcessDpp) -> NotaryResult<()> {
        self.0.set_dpp(id, dpp)
    }
    fn append_notarization(&self, record: &Notarization) -> NotaryResult<()> {
        self.0.append_notarization(record)
    }
    fn list_notarizations(&self, process_id: &ProcessId) -> NotaryResult<Vec<Notarization>> {
        self.0.list_notarizations(process_id)
    }
    fn save_attachment(&self, attachment: &Attachment) -> NotaryResult<()> {
        self.0.save_attachment(attachment)
    }
    fn load_attachment(&self, id: &str) -> NotaryResult<Attachment> {
        self.0.load_attachment(id)
    }
    fn delete_attachment(&self, id: &str) -> NotaryResult<()> {
        self.0.delete_attachment(id)
    }
}

#[test]
fn failed_progress_write_removes_the_upload() -> anyhow::Result<()> {
    let workflow = Workflow::from_yaml("certificate", CERTIFICATE)?;
    let blobs = MemoryBlobStore::new();
    let service = ProcessService::new(
        Arc::new(ProgressFails(MemoryStore::new())),
        Arc::new(blobs.clone()),
        Arc::new(AllowAll),
        1024,
    );
    let pid = service.start_process(&workflow)?.id;

    let upload = Upload {
        filename: "cert.txt".to_string(),
        content_type: Some("text/plain".to_string()),
        reader: &b"certified"[..],
    };
    let err = service
        .complete_substep(&workflow, &pid, "upload", &ops(), Submission::File(upload))
        .unwrap_err();

    assert!(matches!(err, NotaryError::StoreFailure(_)));
    assert!(blobs.is_empty());
    assert!(service.notarizations(&pid)?.is_empty());
    Ok(())
}

#[test]
fn sled_backed_process_survives_reopen() -> anyhow::Result<()> {
    // Sled uses file-based locking, so each test gets its own database in a temp dir.
    // The handle is shared: a second store over it decodes everything from the trees,
    // while reopening the path would race the background flusher for the lock.
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("test_sled_process.db"))?);
    let workflow = Workflow::from_yaml("bottling", BOTTLING)?;

    let (pid, root, digests) = {
        let store = Arc::new(SledStore::new(Arc::clone(&db))?);
        let service = ProcessService::new(
            store.clone(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(RoleAuthorizer),
            1024,
        );
        let pid = service.start_process(&workflow)?.id;
        for (substep, value) in [("fill", "10"), ("label", "LOT-9"), ("release", "alice")] {
            service
                .complete_substep(&workflow, &pid, substep, &ops(), text(value))
                .with_context(|| format!("Failed on {substep}: "))?;
        }
        let root = service.export_merkle(&workflow, &pid)?.root;
        let digests: Vec<String> = service
            .notarizations(&pid)?
            .into_iter()
            .map(|n| n.digest)
            .collect();
        store.flush()?;
        (pid, root, digests)
    };

    let store = SledStore::new(db)?;
    let process = store.load_process(&pid)?;
    assert_eq!(process.status, ProcessStatus::Done);
    assert_eq!(process.dpp.as_ref().map(|d| d.lot.as_str()), Some("LOT-9"));
    assert_eq!(store.list_processes("bottling")?.len(), 1);

    let log = store.list_notarizations(&pid)?;
    let reloaded: Vec<String> = log.iter().map(|n| n.digest.clone()).collect();
    assert_eq!(reloaded, digests);
    assert_eq!(
        log.iter().map(|n| n.substep_id.as_str()).collect::<Vec<_>>(),
        vec!["fill", "label", "release"]
    );
    // digest is recomputable from the stored payload
    assert_eq!(
        log[0].digest,
        sha256::digest(to_canonical_string(&log[0].payload.to_value()))
    );

    let service = ProcessService::new(
        Arc::new(store),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(RoleAuthorizer),
        1024,
    );
    assert_eq!(service.export_merkle(&workflow, &pid)?.root, root);

    let export = serde_json::to_value(service.export_notarized(&workflow, &pid)?)?;
    assert_eq!(
        serde_json::to_string(&export["steps"][0]["substeps"][0]["payload"])?,
        r#"{"litres":10}"#
    );
    Ok(())
}
