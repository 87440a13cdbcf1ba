//! Service layer API for process operations
use crate::attachment::{Attachment, AttachmentWriter, BlobStore, FsBlobStore};
use crate::authz::{AuthzInput, Authorizer, RoleAuthorizer};
use crate::config::NotaryConfig;
use crate::dpp::{self, parse_digital_link_path};
use crate::error::{NotaryError, NotaryResult};
use crate::merkle::MerkleTree;
use crate::normalize::{Submission, normalize};
use crate::notary::{self, NotarizedExport};
use crate::process::{Notarization, Process, ProcessDpp, ProcessStatus, ProcessStep};
use crate::sequence::{self, SubstepAvailability};
use crate::sled_store::SledStore;
use crate::store::Store;
use crate::types::{Actor, ProcessId, TimeStamp};
use crate::workflow::Workflow;
use chrono::Utc;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a completion request.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The substep was recorded. `process` reflects every write made by the call.
    Recorded {
        process: Process,
        notarization: Notarization,
    },
    /// The substep was already done; nothing was written.
    AlreadyDone { process: Process, step: ProcessStep },
}

impl Completion {
    pub fn process(&self) -> &Process {
        match self {
            Completion::Recorded { process, .. } | Completion::AlreadyDone { process, .. } => process,
        }
    }
}

pub struct ProcessService {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    authorizer: Arc<dyn Authorizer>,
    max_attachment_bytes: u64,
}

impl ProcessService {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        authorizer: Arc<dyn Authorizer>,
        max_attachment_bytes: u64,
    ) -> Self {
        Self {
            store,
            blobs,
            authorizer,
            max_attachment_bytes,
        }
    }

    /// Sled store and blob directory under `data_dir`, role-based authorization.
    pub fn from_config(config: &NotaryConfig) -> NotaryResult<Self> {
        let store = SledStore::open(config.db_path())?;
        let blobs = FsBlobStore::open(config.blob_dir())?;
        Ok(Self::new(
            Arc::new(store),
            Arc::new(blobs),
            Arc::new(RoleAuthorizer),
            config.max_attachment_bytes,
        ))
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Create a new active process for `workflow` with every substep pending
    pub fn start_process(&self, workflow: &Workflow) -> NotaryResult<Process> {
        let process = Process::new(workflow);
        self.store.create_process(&process)?;

        info!(process_id = %process.id, workflow = workflow.key(), "process created");
        Ok(process)
    }

    pub fn load_process(&self, id: &ProcessId) -> NotaryResult<Process> {
        self.store.load_process(id)
    }

    /// Load a process and check it runs `workflow`
    fn load_for(&self, workflow: &Workflow, id: &ProcessId) -> NotaryResult<Process> {
        let process = self.store.load_process(id)?;
        process.ensure_workflow(workflow)?;
        Ok(process)
    }

    /// Done/available/locked state of every substep, in workflow order
    pub fn availability<'w>(
        &self,
        workflow: &'w Workflow,
        id: &ProcessId,
    ) -> NotaryResult<Vec<SubstepAvailability<'w>>> {
        let process = self.load_for(workflow, id)?;
        Ok(sequence::availability(workflow, Some(&process)))
    }

    /// Complete one substep: authorize, gate, normalize, record, then finish the
    /// process if this was the last open substep. Resubmitting a done substep is
    /// answered with `AlreadyDone` only once the actor passed the policy.
    pub fn complete_substep<R: Read>(
        &self,
        workflow: &Workflow,
        process_id: &ProcessId,
        substep_id: &str,
        actor: &Actor,
        submission: Submission<R>,
    ) -> NotaryResult<Completion> {
        let mut process = self.load_for(workflow, process_id)?;
        let found = workflow
            .find(substep_id)
            .ok_or_else(|| NotaryError::not_found("substep", substep_id))?;

        let sequence_ok = sequence::is_sequence_ok(workflow, Some(&process), substep_id);
        let decision = self.authorizer.decide(&AuthzInput {
            actor,
            process_id: &process.id,
            workflow_key: workflow.key(),
            substep: found.substep,
            step_order: found.step.order,
            organization: found.step.organization.as_deref(),
            sequence_ok,
        });
        let decision = match decision {
            Ok(decision) => decision,
            Err(NotaryError::AuthorizationUnavailable(msg)) => {
                return Err(NotaryError::AuthorizationUnavailable(msg));
            }
            Err(err) => return Err(NotaryError::AuthorizationUnavailable(err.to_string())),
        };
        if !sequence_ok {
            warn!(process_id = %process.id, substep_id, "substep attempted out of order");
            return Err(NotaryError::SequenceViolation(substep_id.to_string()));
        }
        if !decision.allowed {
            warn!(
                process_id = %process.id,
                substep_id,
                user_id = %actor.user_id,
                role = %actor.role,
                reason = %decision.reason,
                "completion denied"
            );
            return Err(NotaryError::AuthorizationDenied {
                substep_id: substep_id.to_string(),
                reason: decision.reason,
            });
        }

        // only an authorized actor gets to see the stored step
        if let Some(step) = process.step(substep_id).filter(|s| s.is_done()) {
            debug!(process_id = %process.id, substep_id, "substep already done, nothing written");
            let step = step.clone();
            return Ok(Completion::AlreadyDone { process, step });
        }

        let writer = AttachmentWriter::new(
            self.store.as_ref(),
            self.blobs.as_ref(),
            process.id,
            substep_id,
            self.max_attachment_bytes,
        );
        let payload = match normalize(found.substep, submission, &writer) {
            Ok(payload) => payload,
            Err(err) => {
                writer.rollback();
                return Err(err);
            }
        };

        let now = TimeStamp::<Utc>::new();
        let step = ProcessStep::done(actor.clone(), payload.clone(), now.clone());
        if let Err(err) = self.store.update_progress(&process.id, substep_id, &step) {
            writer.rollback();
            return Err(err);
        }
        process.progress.insert(substep_id.to_string(), step);

        let notarization = Notarization::new(
            process.id,
            substep_id.to_string(),
            payload,
            actor.clone(),
            now,
        )
        .map_err(NotaryError::StoreFailure)?;
        self.store.append_notarization(&notarization)?;

        info!(
            process_id = %process.id,
            workflow = workflow.key(),
            substep_id,
            user_id = %actor.user_id,
            digest = %notarization.digest,
            "substep completed"
        );

        if sequence::is_process_done(workflow, &process) {
            self.finish(workflow, &mut process)?;
        }

        Ok(Completion::Recorded {
            process,
            notarization,
        })
    }

    // Status flips to done; a DPP failure is logged only, `ensure_dpp` can retry it.
    fn finish(&self, workflow: &Workflow, process: &mut Process) -> NotaryResult<()> {
        if process.status != ProcessStatus::Done {
            self.store.update_status(&process.id, ProcessStatus::Done)?;
            process.status = ProcessStatus::Done;
            info!(process_id = %process.id, workflow = workflow.key(), "process done");
        }

        if let Err(err) = self.generate_dpp(workflow, process) {
            warn!(process_id = %process.id, error = %err, "product passport not generated");
        }
        Ok(())
    }

    // Generates at most once: an existing DPP is returned untouched.
    fn generate_dpp(&self, workflow: &Workflow, process: &mut Process) -> NotaryResult<Option<ProcessDpp>> {
        let Some(settings) = workflow.dpp() else {
            return Ok(None);
        };
        if let Some(existing) = &process.dpp {
            return Ok(Some(existing.clone()));
        }

        let generated = dpp::generate(workflow, process, settings)?;
        self.store.set_dpp(&process.id, &generated)?;
        process.dpp = Some(generated.clone());

        info!(
            process_id = %process.id,
            link = %generated.digital_link(),
            "product passport generated"
        );
        Ok(Some(generated))
    }

    /// Return the process' DPP, generating it now if the process is done and has none yet
    pub fn ensure_dpp(&self, workflow: &Workflow, id: &ProcessId) -> NotaryResult<ProcessDpp> {
        let mut process = self.load_for(workflow, id)?;
        if workflow.dpp().is_none() {
            return Err(NotaryError::DppUnavailable(format!(
                "workflow '{}' has no product passport configured",
                workflow.key()
            )));
        }
        if !sequence::is_process_done(workflow, &process) {
            return Err(NotaryError::DppUnavailable(format!(
                "process '{}' is not done yet",
                process.id
            )));
        }
        if process.status != ProcessStatus::Done {
            self.store.update_status(&process.id, ProcessStatus::Done)?;
            process.status = ProcessStatus::Done;
        }

        self.generate_dpp(workflow, &mut process)?.ok_or_else(|| {
            NotaryError::DppUnavailable(format!("no passport for process '{}'", process.id))
        })
    }

    /// Find the process of `workflow` whose DPP matches a Digital Link path
    pub fn resolve_digital_link(&self, workflow: &Workflow, path: &str) -> NotaryResult<Process> {
        let link = parse_digital_link_path(path)?;
        let settings = workflow.dpp().ok_or_else(|| {
            NotaryError::DppUnavailable(format!(
                "workflow '{}' has no product passport configured",
                workflow.key()
            ))
        })?;
        if link.gtin != settings.gtin {
            return Err(NotaryError::not_found("product", link.to_path()));
        }

        self.store
            .list_processes(workflow.key())?
            .into_iter()
            .find(|p| p.dpp.as_ref().is_some_and(|d| d.matches(&link)))
            .ok_or_else(|| NotaryError::not_found("product", link.to_path()))
    }

    /// Full notarized export with the Merkle tree over the current state
    pub fn export_notarized(&self, workflow: &Workflow, id: &ProcessId) -> NotaryResult<NotarizedExport> {
        let process = self.load_for(workflow, id)?;

        let mut attachments = HashMap::new();
        for attachment_id in notary::referenced_attachments(&process) {
            match self.store.load_attachment(&attachment_id) {
                Ok(meta) => {
                    attachments.insert(attachment_id, meta);
                }
                Err(NotaryError::NotFound { .. }) => {
                    debug!(process_id = %process.id, attachment_id = %attachment_id, "referenced attachment missing");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(notary::build_export(workflow, &process, &attachments))
    }

    pub fn export_merkle(&self, workflow: &Workflow, id: &ProcessId) -> NotaryResult<MerkleTree> {
        let process = self.load_for(workflow, id)?;
        Ok(notary::merkle_for(workflow, &process))
    }

    /// Append-only audit log of a process, oldest first
    pub fn notarizations(&self, id: &ProcessId) -> NotaryResult<Vec<Notarization>> {
        self.store.list_notarizations(id)
    }

    /// Attachment metadata plus a reader over the stored bytes
    pub fn open_attachment(&self, id: &str) -> NotaryResult<(Attachment, Box<dyn Read + Send>)> {
        let meta = self.store.load_attachment(id)?;
        let reader = self.blobs.open(&meta.id)?;
        Ok((meta, reader))
    }
}
