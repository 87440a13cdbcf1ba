//! Digital Product Passport identifiers: GTIN/Lot/Serial derivation and GS1 Digital Link paths
use crate::error::{NotaryError, NotaryResult};
use crate::process::{Process, ProcessDpp};
use crate::types::TimeStamp;
use crate::workflow::Workflow;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

const GTIN_LEN: usize = 14;
const AI_GTIN: &str = "01";
const AI_LOT: &str = "10";
const AI_SERIAL: &str = "21";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialStrategy {
    /// The process id rendered as lowercase hex.
    ProcessIdHex,
}

/// DPP settings after load-time validation; the GTIN is already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DppSettings {
    pub gtin: String,
    pub lot_input_key: String,
    pub lot_default: String,
    pub serial_input_key: String,
    pub serial_strategy: SerialStrategy,
}

/// A decoded GTIN/Lot/Serial triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalLink {
    pub gtin: String,
    pub lot: String,
    pub serial: String,
}

impl FromStr for SerialStrategy {
    type Err = NotaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "process_id_hex" => Ok(SerialStrategy::ProcessIdHex),
            other => Err(NotaryError::config(format!(
                "unsupported serial strategy '{other}'"
            ))),
        }
    }
}

/// Left-pads an all-digit GTIN to 14 digits.
pub fn normalize_gtin(raw: &str) -> NotaryResult<String> {
    let gtin = raw.trim();
    if gtin.is_empty() {
        return Err(NotaryError::config("GTIN is empty"));
    }
    if !gtin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NotaryError::config(format!("GTIN '{gtin}' must be digits only")));
    }
    if gtin.len() > GTIN_LEN {
        return Err(NotaryError::config(format!(
            "GTIN '{gtin}' is longer than {GTIN_LEN} digits"
        )));
    }
    Ok(format!("{:0>width$}", gtin, width = GTIN_LEN))
}

/// First non-empty string under `key` among done substeps, in workflow order.
/// The key is looked up at the top of each payload, then one level inside object values.
fn lookup_completed(workflow: &Workflow, process: &Process, key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    workflow.ordered().find_map(|r| {
        let data = process.step(&r.substep.substep_id)?.data.as_ref()?;
        let direct = non_empty_str(data.get(key));
        direct.or_else(|| {
            data.values().find_map(|v| match v {
                Value::Object(inner) => non_empty_str(inner.get(key)),
                _ => None,
            })
        })
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

pub fn resolve_lot(workflow: &Workflow, process: &Process, settings: &DppSettings) -> Option<String> {
    lookup_completed(workflow, process, &settings.lot_input_key).or_else(|| {
        (!settings.lot_default.is_empty()).then(|| settings.lot_default.clone())
    })
}

pub fn resolve_serial(workflow: &Workflow, process: &Process, settings: &DppSettings) -> String {
    lookup_completed(workflow, process, &settings.serial_input_key).unwrap_or_else(|| {
        match settings.serial_strategy {
            SerialStrategy::ProcessIdHex => process.id.to_hex(),
        }
    })
}

/// Derives the passport for a process. Callers decide when (first time the process is done).
pub fn generate(workflow: &Workflow, process: &Process, settings: &DppSettings) -> NotaryResult<ProcessDpp> {
    let lot = resolve_lot(workflow, process, settings).ok_or_else(|| {
        NotaryError::DppUnavailable(format!(
            "no lot value found for process '{}' and no default lot configured",
            process.id
        ))
    })?;
    let serial = resolve_serial(workflow, process, settings);

    Ok(ProcessDpp {
        gtin: settings.gtin.clone(),
        lot,
        serial,
        generated_at: TimeStamp::<Utc>::new(),
    })
}

/// `/01/{gtin}/10/{lot}/21/{serial}` with every segment escaped on its own.
pub fn digital_link_url(gtin: &str, lot: &str, serial: &str) -> String {
    format!(
        "/{AI_GTIN}/{}/{AI_LOT}/{}/{AI_SERIAL}/{}",
        urlencoding::encode(gtin),
        urlencoding::encode(lot),
        urlencoding::encode(serial)
    )
}

pub fn parse_digital_link_path(path: &str) -> NotaryResult<DigitalLink> {
    let trimmed = path.trim().trim_start_matches('/').trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();

    if segments.len() != 6 || segments.iter().any(|s| s.is_empty()) {
        return Err(NotaryError::validation(format!(
            "digital link path '{path}' must have 6 non-empty segments"
        )));
    }
    if segments[0] != AI_GTIN || segments[2] != AI_LOT || segments[4] != AI_SERIAL {
        return Err(NotaryError::validation(format!(
            "digital link path '{path}' must use the 01/10/21 markers"
        )));
    }

    let gtin = normalize_gtin(&unescape(segments[1])?)
        .map_err(|e| NotaryError::validation(e.to_string()))?;
    let lot = unescape(segments[3])?.trim().to_string();
    let serial = unescape(segments[5])?.trim().to_string();

    if lot.is_empty() || serial.is_empty() {
        return Err(NotaryError::validation(
            "digital link lot and serial must not be empty",
        ));
    }

    Ok(DigitalLink { gtin, lot, serial })
}

fn unescape(segment: &str) -> NotaryResult<String> {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .map_err(|e| NotaryError::validation(format!("bad escape in '{segment}': {e}")))
}

impl DigitalLink {
    pub fn to_path(&self) -> String {
        digital_link_url(&self.gtin, &self.lot, &self.serial)
    }
}

impl ProcessDpp {
    pub fn digital_link(&self) -> String {
        digital_link_url(&self.gtin, &self.lot, &self.serial)
    }

    pub fn matches(&self, link: &DigitalLink) -> bool {
        self.gtin == link.gtin && self.lot == link.lot && self.serial == link.serial
    }
}
