//! Sled-backed store. One tree per record kind, values encoded as CBOR.
use crate::attachment::Attachment;
use crate::error::{NotaryError, NotaryResult};
use crate::process::{Notarization, Process, ProcessDpp, ProcessStatus, ProcessStep};
use crate::store::Store;
use crate::types::ProcessId;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const PROCESSES: &str = "processes";
const NOTARIZATIONS: &str = "notarizations";
const ATTACHMENTS: &str = "attachments";

pub struct SledStore {
    instance: Arc<sled::Db>,
    processes: sled::Tree,
    notarizations: sled::Tree,
    attachments: sled::Tree,
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> NotaryResult<Vec<u8>> {
    minicbor::to_vec(value).map_err(NotaryError::store)
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> NotaryResult<T> {
    minicbor::decode(bytes).map_err(NotaryError::store)
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> NotaryResult<Self> {
        let processes = instance.open_tree(PROCESSES).map_err(NotaryError::store)?;
        let notarizations = instance.open_tree(NOTARIZATIONS).map_err(NotaryError::store)?;
        let attachments = instance.open_tree(ATTACHMENTS).map_err(NotaryError::store)?;
        Ok(Self {
            instance,
            processes,
            notarizations,
            attachments,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> NotaryResult<Self> {
        let db = sled::open(path.as_ref()).map_err(NotaryError::store)?;
        debug!(path = %path.as_ref().display(), "sled database opened");
        Self::new(Arc::new(db))
    }

    pub fn flush(&self) -> NotaryResult<()> {
        self.instance.flush().map_err(NotaryError::store)?;
        Ok(())
    }

    // Decode, mutate, encode inside sled's compare-and-swap loop. `f` runs again whenever
    // another writer got in between, so it must only depend on the record it is given.
    fn modify(&self, id: &ProcessId, mut f: impl FnMut(&mut Process)) -> NotaryResult<()> {
        let mut outcome: NotaryResult<()> = Ok(());
        self.processes
            .fetch_and_update(id.to_hex().as_bytes(), |old| {
                let Some(bytes) = old else {
                    outcome = Err(NotaryError::not_found("process", id.to_string()));
                    return None;
                };
                let updated = decode::<Process>(bytes).and_then(|mut process| {
                    f(&mut process);
                    encode(&process)
                });
                match updated {
                    Ok(next) => {
                        outcome = Ok(());
                        Some(next)
                    }
                    Err(err) => {
                        outcome = Err(err);
                        Some(bytes.to_vec())
                    }
                }
            })
            .map_err(NotaryError::store)?;
        outcome
    }
}

impl Store for SledStore {
    fn create_process(&self, process: &Process) -> NotaryResult<()> {
        self.processes
            .insert(process.id.to_hex().as_bytes(), encode(process)?)
            .map_err(NotaryError::store)?;
        Ok(())
    }

    fn load_process(&self, id: &ProcessId) -> NotaryResult<Process> {
        match self.processes.get(id.to_hex().as_bytes()).map_err(NotaryError::store)? {
            Some(bytes) => decode(&bytes),
            None => Err(NotaryError::not_found("process", id.to_string())),
        }
    }

    fn list_processes(&self, workflow_key: &str) -> NotaryResult<Vec<Process>> {
        let mut out = Vec::new();
        for entry in self.processes.iter() {
            let (_, bytes) = entry.map_err(NotaryError::store)?;
            let process: Process = decode(&bytes)?;
            if process.workflow_key == workflow_key {
                out.push(process);
            }
        }
        Ok(out)
    }

    fn update_progress(&self, id: &ProcessId, substep_id: &str, step: &ProcessStep) -> NotaryResult<()> {
        self.modify(id, |p| {
            p.progress.insert(substep_id.to_string(), step.clone());
        })
    }

    fn update_status(&self, id: &ProcessId, status: ProcessStatus) -> NotaryResult<()> {
        self.modify(id, |p| p.status = status)
    }

    fn set_dpp(&self, id: &ProcessId, dpp: &ProcessDpp) -> NotaryResult<()> {
        self.modify(id, |p| p.dpp = Some(dpp.clone()))
    }

    fn append_notarization(&self, record: &Notarization) -> NotaryResult<()> {
        // process id, then a monotonic sequence, so a prefix scan yields insertion order
        let seq = self.instance.generate_id().map_err(NotaryError::store)?;
        let key = format!("{}/{seq:020}", record.process_id.to_hex());
        self.notarizations
            .insert(key.as_bytes(), encode(record)?)
            .map_err(NotaryError::store)?;
        Ok(())
    }

    fn list_notarizations(&self, process_id: &ProcessId) -> NotaryResult<Vec<Notarization>> {
        let prefix = format!("{}/", process_id.to_hex());
        self.notarizations
            .scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (_, bytes) = entry.map_err(NotaryError::store)?;
                decode(&bytes)
            })
            .collect()
    }

    fn save_attachment(&self, attachment: &Attachment) -> NotaryResult<()> {
        self.attachments
            .insert(attachment.id.as_bytes(), encode(attachment)?)
            .map_err(NotaryError::store)?;
        Ok(())
    }

    fn load_attachment(&self, id: &str) -> NotaryResult<Attachment> {
        match self.attachments.get(id.as_bytes()).map_err(NotaryError::store)? {
            Some(bytes) => decode(&bytes),
            None => Err(NotaryError::not_found("attachment", id)),
        }
    }

    fn delete_attachment(&self, id: &str) -> NotaryResult<()> {
        self.attachments.remove(id.as_bytes()).map_err(NotaryError::store)?;
        Ok(())
    }
}
