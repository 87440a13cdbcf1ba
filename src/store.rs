//! Persistence contract consumed by the service layer, plus an in-memory implementation.
//!
//! Every method is atomic on its own; nothing is transactional across keys. Progress
//! updates are blind writes: the last writer for a substep wins.
use crate::attachment::Attachment;
use crate::error::{NotaryError, NotaryResult};
use crate::process::{Notarization, Process, ProcessDpp, ProcessStatus, ProcessStep};
use crate::types::ProcessId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

pub trait Store: Send + Sync {
    fn create_process(&self, process: &Process) -> NotaryResult<()>;
    fn load_process(&self, id: &ProcessId) -> NotaryResult<Process>;
    fn list_processes(&self, workflow_key: &str) -> NotaryResult<Vec<Process>>;
    fn update_progress(&self, id: &ProcessId, substep_id: &str, step: &ProcessStep) -> NotaryResult<()>;
    fn update_status(&self, id: &ProcessId, status: ProcessStatus) -> NotaryResult<()>;
    fn set_dpp(&self, id: &ProcessId, dpp: &ProcessDpp) -> NotaryResult<()>;
    fn append_notarization(&self, record: &Notarization) -> NotaryResult<()>;
    /// Notarizations of one process, oldest first.
    fn list_notarizations(&self, process_id: &ProcessId) -> NotaryResult<Vec<Notarization>>;
    fn save_attachment(&self, attachment: &Attachment) -> NotaryResult<()>;
    fn load_attachment(&self, id: &str) -> NotaryResult<Attachment>;
    /// Removing an absent attachment is not an error.
    fn delete_attachment(&self, id: &str) -> NotaryResult<()>;
}

#[derive(Default)]
struct Tables {
    processes: HashMap<ProcessId, Process>,
    notarizations: Vec<Notarization>,
    attachments: HashMap<String, Attachment>,
}

/// Store kept entirely in memory, for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> NotaryResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| NotaryError::store(anyhow::anyhow!("memory store lock poisoned")))
    }

    fn with_process<T>(
        &self,
        id: &ProcessId,
        f: impl FnOnce(&mut Process) -> T,
    ) -> NotaryResult<T> {
        let mut tables = self.tables()?;
        let process = tables
            .processes
            .get_mut(id)
            .ok_or_else(|| NotaryError::not_found("process", id.to_string()))?;
        Ok(f(process))
    }
}

impl Store for MemoryStore {
    fn create_process(&self, process: &Process) -> NotaryResult<()> {
        self.tables()?.processes.insert(process.id, process.clone());
        Ok(())
    }

    fn load_process(&self, id: &ProcessId) -> NotaryResult<Process> {
        self.tables()?
            .processes
            .get(id)
            .cloned()
            .ok_or_else(|| NotaryError::not_found("process", id.to_string()))
    }

    fn list_processes(&self, workflow_key: &str) -> NotaryResult<Vec<Process>> {
        let mut out: Vec<Process> = self
            .tables()?
            .processes
            .values()
            .filter(|p| p.workflow_key == workflow_key)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    fn update_progress(&self, id: &ProcessId, substep_id: &str, step: &ProcessStep) -> NotaryResult<()> {
        self.with_process(id, |p| {
            p.progress.insert(substep_id.to_string(), step.clone());
        })
    }

    fn update_status(&self, id: &ProcessId, status: ProcessStatus) -> NotaryResult<()> {
        self.with_process(id, |p| p.status = status)
    }

    fn set_dpp(&self, id: &ProcessId, dpp: &ProcessDpp) -> NotaryResult<()> {
        self.with_process(id, |p| p.dpp = Some(dpp.clone()))
    }

    fn append_notarization(&self, record: &Notarization) -> NotaryResult<()> {
        self.tables()?.notarizations.push(record.clone());
        Ok(())
    }

    fn list_notarizations(&self, process_id: &ProcessId) -> NotaryResult<Vec<Notarization>> {
        Ok(self
            .tables()?
            .notarizations
            .iter()
            .filter(|n| n.process_id == *process_id)
            .cloned()
            .collect())
    }

    fn save_attachment(&self, attachment: &Attachment) -> NotaryResult<()> {
        self.tables()?
            .attachments
            .insert(attachment.id.clone(), attachment.clone());
        Ok(())
    }

    fn load_attachment(&self, id: &str) -> NotaryResult<Attachment> {
        self.tables()?
            .attachments
            .get(id)
            .cloned()
            .ok_or_else(|| NotaryError::not_found("attachment", id))
    }

    fn delete_attachment(&self, id: &str) -> NotaryResult<()> {
        self.tables()?.attachments.remove(id);
        Ok(())
    }
}
