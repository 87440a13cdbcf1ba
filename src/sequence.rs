//! Sequencing gate: one open substep at a time across the whole process.
//!
//! Substeps are walked in workflow order. The first one not yet done is the only one that
//! may be completed; everything after it is locked regardless of which role owns it.
use crate::process::Process;
use crate::workflow::{SubstepRef, Workflow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstepState {
    Done,
    Available,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstepAvailability<'a> {
    pub substep_id: &'a str,
    pub state: SubstepState,
}

impl SubstepAvailability<'_> {
    pub fn is_available(&self) -> bool {
        self.state == SubstepState::Available
    }
}

fn is_done(process: Option<&Process>, substep_id: &str) -> bool {
    process.is_some_and(|p| p.is_step_done(substep_id))
}

/// State of every substep, in workflow order.
pub fn availability<'a>(workflow: &'a Workflow, process: Option<&Process>) -> Vec<SubstepAvailability<'a>> {
    let mut open_seen = false;
    workflow
        .ordered()
        .map(|r| {
            let substep_id = r.substep.substep_id.as_str();
            let state = if is_done(process, substep_id) {
                SubstepState::Done
            } else if !open_seen {
                open_seen = true;
                SubstepState::Available
            } else {
                SubstepState::Locked
            };
            SubstepAvailability { substep_id, state }
        })
        .collect()
}

/// The single substep that may be completed now, if any.
pub fn next_available<'a>(workflow: &'a Workflow, process: Option<&Process>) -> Option<SubstepRef<'a>> {
    workflow
        .ordered()
        .find(|r| !is_done(process, &r.substep.substep_id))
}

/// True when every substep before `substep_id` is done. Says nothing about whether
/// `substep_id` itself has been completed already.
pub fn is_sequence_ok(workflow: &Workflow, process: Option<&Process>, substep_id: &str) -> bool {
    for r in workflow.ordered() {
        if r.substep.substep_id == substep_id {
            return true;
        }
        if !is_done(process, &r.substep.substep_id) {
            return false;
        }
    }
    false
}

pub fn is_process_done(workflow: &Workflow, process: &Process) -> bool {
    workflow
        .ordered()
        .all(|r| process.is_step_done(&r.substep.substep_id))
}
