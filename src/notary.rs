//! Notarized export: per-substep records, their leaf hashes and the Merkle root over them.
//!
//! A leaf is `sha256(canonical_json(record))` where the record holds `substep_id` and
//! `status`, plus `done_at`, `done_by`, `done_role` and `payload` once the substep is done.
//! Absent fields are left out, never written as null.
use crate::attachment::{Attachment, collect_refs};
use crate::canonical::to_canonical_string;
use crate::merkle::{MerkleLeaf, MerkleTree, build_merkle_tree};
use crate::process::{Process, ProcessStatus, ProcessStep};
use crate::sequence::{SubstepState, availability, is_process_done};
use crate::types::{ProcessId, TimeStamp};
use crate::workflow::{Substep, Workflow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotarizedExport {
    pub process_id: ProcessId,
    pub created_at: TimeStamp<Utc>,
    pub status: ProcessStatus,
    pub steps: Vec<ExportStep>,
    pub merkle: MerkleTree,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportStep {
    pub step_id: String,
    pub title: String,
    pub substeps: Vec<ExportSubstep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSubstep {
    pub substep_id: String,
    pub title: String,
    pub role: String,
    pub status: SubstepState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub done_at: Option<TimeStamp<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub done_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub done_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attachment: Option<Attachment>,
}

/// Status reported for a process: done once stored as done or once every substep is done.
pub fn effective_status(workflow: &Workflow, process: &Process) -> ProcessStatus {
    if process.status == ProcessStatus::Done || is_process_done(workflow, process) {
        ProcessStatus::Done
    } else {
        ProcessStatus::Active
    }
}

fn done_step<'p>(process: &'p Process, substep_id: &str, state: SubstepState) -> Option<&'p ProcessStep> {
    match state {
        SubstepState::Done => process.step(substep_id).filter(|s| s.is_done()),
        _ => None,
    }
}

/// The record a leaf hash is taken over.
pub fn leaf_record(substep_id: &str, state: SubstepState, step: Option<&ProcessStep>) -> Value {
    let mut record = Map::new();
    record.insert("substep_id".into(), Value::String(substep_id.to_string()));
    record.insert(
        "status".into(),
        serde_json::to_value(state).unwrap_or(Value::Null),
    );

    if let Some(step) = step {
        if let Some(at) = &step.done_at {
            record.insert("done_at".into(), Value::String(at.to_rfc3339()));
        }
        if let Some(actor) = &step.done_by {
            record.insert("done_by".into(), Value::String(actor.user_id.clone()));
            record.insert("done_role".into(), Value::String(actor.role.clone()));
        }
        if let Some(data) = &step.data {
            record.insert("payload".into(), data.to_value());
        }
    }
    Value::Object(record)
}

pub fn leaf_hash(record: &Value) -> String {
    sha256::digest(to_canonical_string(record))
}

/// Leaves in workflow order.
pub fn build_leaves(workflow: &Workflow, process: &Process) -> Vec<MerkleLeaf> {
    availability(workflow, Some(process))
        .into_iter()
        .map(|a| {
            let step = done_step(process, a.substep_id, a.state);
            MerkleLeaf {
                substep_id: a.substep_id.to_string(),
                hash: leaf_hash(&leaf_record(a.substep_id, a.state, step)),
            }
        })
        .collect()
}

pub fn merkle_for(workflow: &Workflow, process: &Process) -> MerkleTree {
    build_merkle_tree(build_leaves(workflow, process))
}

/// Ids of every attachment referenced from the process' payloads.
pub fn referenced_attachments(process: &Process) -> Vec<String> {
    process
        .progress
        .values()
        .filter_map(|s| s.data.as_ref())
        .flat_map(|d| collect_refs(&d.to_value()))
        .map(|r| r.attachment_id)
        .collect()
}

fn export_substep(
    substep: &Substep,
    state: SubstepState,
    step: Option<&ProcessStep>,
    attachments: &HashMap<String, Attachment>,
) -> ExportSubstep {
    let payload = step.and_then(|s| s.data.as_ref());
    let attachment = payload
        .and_then(|p| collect_refs(&p.to_value()).into_iter().next())
        .and_then(|r| attachments.get(&r.attachment_id))
        .map(Attachment::for_display);

    ExportSubstep {
        substep_id: substep.substep_id.clone(),
        title: substep.title.clone(),
        role: substep.roles.join(","),
        status: state,
        done_at: step.and_then(|s| s.done_at.clone()),
        done_by: step.and_then(|s| s.done_by.as_ref().map(|a| a.user_id.clone())),
        done_role: step.and_then(|s| s.done_by.as_ref().map(|a| a.role.clone())),
        payload: payload.map(|p| p.to_value()),
        digest: payload.map(|p| p.digest()),
        attachment,
    }
}

/// Builds the full export. `attachments` holds the metadata of referenced attachments;
/// missing entries simply leave `attachment` out.
pub fn build_export(
    workflow: &Workflow,
    process: &Process,
    attachments: &HashMap<String, Attachment>,
) -> NotarizedExport {
    let states: HashMap<&str, SubstepState> = availability(workflow, Some(process))
        .into_iter()
        .map(|a| (a.substep_id, a.state))
        .collect();

    let steps = workflow
        .ordered_steps()
        .into_iter()
        .map(|(step, substeps)| ExportStep {
            step_id: step.step_id.clone(),
            title: step.title.clone(),
            substeps: substeps
                .into_iter()
                .map(|sub| {
                    let state = states
                        .get(sub.substep_id.as_str())
                        .copied()
                        .unwrap_or(SubstepState::Locked);
                    let done = done_step(process, &sub.substep_id, state);
                    export_substep(sub, state, done, attachments)
                })
                .collect(),
        })
        .collect();

    NotarizedExport {
        process_id: process.id,
        created_at: process.created_at.clone(),
        status: effective_status(workflow, process),
        steps,
        merkle: merkle_for(workflow, process),
    }
}
