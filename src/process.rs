//! Process instances, their per-substep progress and the notarization log records
use crate::canonical::{digest_payload, to_canonical_string};
use crate::error::{NotaryError, NotaryResult};
use crate::types::{Actor, ProcessId, TimeStamp};
use crate::utils;
use crate::workflow::Workflow;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::Deref;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    #[n(0)]
    Pending,
    #[n(1)]
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Done,
}

/// Canonical value stored for a completed substep: `{input_key: value}`.
/// Persisted as its canonical JSON text so the bytes that were hashed are the bytes kept.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
pub struct ProcessStep {
    #[n(0)]
    pub state: StepState,
    #[n(1)]
    pub done_at: Option<TimeStamp<Utc>>,
    #[n(2)]
    pub done_by: Option<Actor>,
    #[n(3)]
    pub data: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
pub struct ProcessDpp {
    #[n(0)]
    pub gtin: String,
    #[n(1)]
    pub lot: String,
    #[n(2)]
    pub serial: String,
    #[n(3)]
    pub generated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
pub struct Process {
    #[n(0)]
    pub id: ProcessId,
    #[n(1)]
    pub workflow_key: String,
    #[n(2)]
    pub created_at: TimeStamp<Utc>,
    #[n(3)]
    pub status: ProcessStatus,
    #[n(4)]
    pub progress: BTreeMap<String, ProcessStep>,
    #[n(5)]
    pub dpp: Option<ProcessDpp>,
}

/// Append-only audit record of one successful completion.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize)]
pub struct Notarization {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub process_id: ProcessId,
    #[n(2)]
    pub substep_id: String,
    #[n(3)]
    pub payload: Payload,
    #[n(4)]
    pub actor: Actor,
    #[n(5)]
    pub timestamp: TimeStamp<Utc>,
    #[n(6)]
    pub digest: String, // digest_payload of `payload`
}

impl Payload {
    pub fn single(key: impl Into<String>, value: Value) -> Self {
        let mut map = Map::new();
        map.insert(key.into(), value);
        Self(map)
    }
    pub fn digest(&self) -> String {
        digest_payload(&self.0)
    }
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl Deref for Payload {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

impl ProcessStep {
    pub fn pending() -> Self {
        Self {
            state: StepState::Pending,
            done_at: None,
            done_by: None,
            data: None,
        }
    }
    pub fn done(actor: Actor, data: Payload, at: TimeStamp<Utc>) -> Self {
        Self {
            state: StepState::Done,
            done_at: Some(at),
            done_by: Some(actor),
            data: Some(data),
        }
    }
    pub fn is_done(&self) -> bool {
        self.state == StepState::Done
    }
}

impl Process {
    /// A fresh active process with every substep pending.
    pub fn new(workflow: &Workflow) -> Self {
        let progress = workflow
            .ordered()
            .map(|r| (r.substep.substep_id.clone(), ProcessStep::pending()))
            .collect();

        Self {
            id: ProcessId::new(),
            workflow_key: workflow.key().to_string(),
            created_at: TimeStamp::new(),
            status: ProcessStatus::Active,
            progress,
            dpp: None,
        }
    }

    pub fn step(&self, substep_id: &str) -> Option<&ProcessStep> {
        self.progress.get(substep_id)
    }

    pub fn is_step_done(&self, substep_id: &str) -> bool {
        self.step(substep_id).is_some_and(ProcessStep::is_done)
    }

    pub fn ensure_workflow(&self, workflow: &Workflow) -> NotaryResult<()> {
        if self.workflow_key != workflow.key() {
            return Err(NotaryError::WorkflowMismatch {
                process_id: self.id.to_string(),
                expected: self.workflow_key.clone(),
                found: workflow.key().to_string(),
            });
        }
        Ok(())
    }
}

impl Notarization {
    pub fn new(
        process_id: ProcessId,
        substep_id: String,
        payload: Payload,
        actor: Actor,
        timestamp: TimeStamp<Utc>,
    ) -> anyhow::Result<Self> {
        let digest = payload.digest();
        Ok(Self {
            id: utils::new_uuid_to_bech32("ntz")?,
            process_id,
            substep_id,
            payload,
            actor,
            timestamp,
            digest,
        })
    }
    /// CBOR encoding of the record and its hash.
    pub fn build(&self) -> anyhow::Result<(String, Vec<u8>)> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

impl<C> minicbor::Encode<C> for Payload {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&to_canonical_string(&self.to_value()))?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Payload {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let text = d.str()?;

        serde_json::from_str(text)
            .map(Payload)
            .map_err(|_| minicbor::decode::Error::message("payload is not a JSON object"))
    }
}
