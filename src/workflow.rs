//! Workflow definitions: steps, substeps and their validated total order
use crate::dpp::{DppSettings, SerialStrategy, normalize_gtin};
use crate::error::{NotaryError, NotaryResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Number,
    String,
    File,
    Structured,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub dpp: Option<DppConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub title: String,
    pub order: i64,
    #[serde(default)]
    pub organization: Option<String>,
    pub substeps: Vec<Substep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Substep {
    pub substep_id: String,
    pub title: String,
    pub order: i64,
    pub roles: Vec<String>,
    pub input_key: String,
    pub input_type: InputKind,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub ui_schema: Option<Value>,
}

/// Raw DPP block as written in a workflow file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub gtin: String,
    #[serde(default)]
    pub lot_input_key: String,
    #[serde(default)]
    pub lot_default: String,
    #[serde(default)]
    pub serial_input_key: String,
    #[serde(default)]
    pub serial_strategy: String,
}

/// A substep together with the step that owns it.
#[derive(Debug, Clone, Copy)]
pub struct SubstepRef<'a> {
    pub step: &'a Step,
    pub substep: &'a Substep,
}

/// A validated workflow. Only constructible through [`Workflow::new`], so every instance
/// has unique substep ids, a strict total order and well-formed DPP settings.
#[derive(Debug, Clone)]
pub struct Workflow {
    key: String,
    def: WorkflowDef,
    // (step index, substep index) in total order
    order: Vec<(usize, usize)>,
    dpp: Option<DppSettings>,
}

impl Workflow {
    pub fn new(key: impl Into<String>, def: WorkflowDef) -> NotaryResult<Self> {
        let key = key.into();
        if def.steps.is_empty() {
            return Err(NotaryError::config(format!("workflow '{key}' has no steps")));
        }

        let mut seen_ids = HashSet::new();
        let mut seen_orders = HashSet::new();
        let mut order = Vec::new();

        for (si, step) in def.steps.iter().enumerate() {
            if step.substeps.is_empty() {
                return Err(NotaryError::config(format!(
                    "step '{}' in workflow '{key}' has no substeps",
                    step.step_id
                )));
            }
            for (ssi, sub) in step.substeps.iter().enumerate() {
                validate_substep(&key, sub)?;
                if !seen_ids.insert(sub.substep_id.as_str()) {
                    return Err(NotaryError::config(format!(
                        "duplicate substep id '{}' in workflow '{key}'",
                        sub.substep_id
                    )));
                }
                if !seen_orders.insert((step.order, sub.order)) {
                    return Err(NotaryError::config(format!(
                        "substep '{}' repeats order ({}, {}) in workflow '{key}'",
                        sub.substep_id, step.order, sub.order
                    )));
                }
                order.push((si, ssi));
            }
        }

        order.sort_by_key(|&(si, ssi)| (def.steps[si].order, def.steps[si].substeps[ssi].order));

        let dpp = match &def.dpp {
            Some(cfg) if cfg.enabled => Some(validate_dpp(&key, cfg)?),
            _ => None,
        };

        Ok(Self {
            key,
            def,
            order,
            dpp,
        })
    }

    /// Parses a YAML (or JSON) workflow document.
    pub fn from_yaml(key: impl Into<String>, source: &str) -> NotaryResult<Self> {
        let def: WorkflowDef = serde_yaml::from_str(source)
            .map_err(|e| NotaryError::config(format!("malformed workflow definition: {e}")))?;
        Self::new(key, def)
    }

    /// Loads a workflow file; the key is the file stem.
    pub fn load(path: &Path) -> NotaryResult<Self> {
        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| NotaryError::config(format!("bad workflow path {}", path.display())))?;
        let source = std::fs::read_to_string(path)
            .map_err(|e| NotaryError::config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(key, &source)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn def(&self) -> &WorkflowDef {
        &self.def
    }

    pub fn steps(&self) -> &[Step] {
        &self.def.steps
    }

    pub fn dpp(&self) -> Option<&DppSettings> {
        self.dpp.as_ref()
    }

    /// Every substep, ordered by (step order, substep order).
    pub fn ordered(&self) -> impl Iterator<Item = SubstepRef<'_>> + '_ {
        self.order.iter().map(|&(si, ssi)| {
            let step = &self.def.steps[si];
            SubstepRef {
                step,
                substep: &step.substeps[ssi],
            }
        })
    }

    pub fn substep_count(&self) -> usize {
        self.order.len()
    }

    pub fn find(&self, substep_id: &str) -> Option<SubstepRef<'_>> {
        self.ordered().find(|r| r.substep.substep_id == substep_id)
    }

    /// Steps in step order, each with its substeps in substep order.
    pub fn ordered_steps(&self) -> Vec<(&Step, Vec<&Substep>)> {
        let mut out: Vec<(&Step, Vec<&Substep>)> = Vec::new();
        for r in self.ordered() {
            match out.last_mut() {
                Some((step, subs)) if std::ptr::eq(*step, r.step) => subs.push(r.substep),
                _ => out.push((r.step, vec![r.substep])),
            }
        }
        out
    }
}

fn validate_substep(key: &str, sub: &Substep) -> NotaryResult<()> {
    if sub.substep_id.trim().is_empty() {
        return Err(NotaryError::config(format!("workflow '{key}' has a substep without id")));
    }
    if sub.roles.iter().all(|r| r.trim().is_empty()) {
        return Err(NotaryError::config(format!(
            "substep '{}' in workflow '{key}' allows no roles",
            sub.substep_id
        )));
    }
    if sub.input_key.trim().is_empty() {
        return Err(NotaryError::config(format!(
            "substep '{}' in workflow '{key}' has no input key",
            sub.substep_id
        )));
    }
    if sub.input_type == InputKind::Structured && !matches!(sub.schema, Some(Value::Object(_))) {
        return Err(NotaryError::config(format!(
            "structured substep '{}' in workflow '{key}' needs a schema object",
            sub.substep_id
        )));
    }
    Ok(())
}

fn validate_dpp(key: &str, cfg: &DppConfig) -> NotaryResult<DppSettings> {
    let gtin = normalize_gtin(&cfg.gtin)?;
    let serial_strategy: SerialStrategy = cfg.serial_strategy.parse()?;

    let lot_input_key = cfg.lot_input_key.trim().to_string();
    let lot_default = cfg.lot_default.trim().to_string();
    if lot_input_key.is_empty() && lot_default.is_empty() {
        return Err(NotaryError::config(format!(
            "workflow '{key}' enables DPP without a lot input key or default lot"
        )));
    }

    Ok(DppSettings {
        gtin,
        lot_input_key,
        lot_default,
        serial_input_key: cfg.serial_input_key.trim().to_string(),
        serial_strategy,
    })
}
