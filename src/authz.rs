//! Policy gate deciding who may complete what. The core treats the decision as opaque.
use crate::error::NotaryResult;
use crate::types::{Actor, ProcessId};
use crate::workflow::Substep;

/// Everything a policy sees about one completion attempt.
#[derive(Debug, Clone, Copy)]
pub struct AuthzInput<'a> {
    pub actor: &'a Actor,
    pub process_id: &'a ProcessId,
    pub workflow_key: &'a str,
    pub substep: &'a Substep,
    pub step_order: i64,
    pub organization: Option<&'a str>,
    pub sequence_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// An `Err` means the policy could not be consulted at all.
pub trait Authorizer: Send + Sync {
    fn decide(&self, input: &AuthzInput<'_>) -> NotaryResult<Decision>;
}

/// Allows when the acting role is allowed on the substep and actually held by the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleAuthorizer;

impl Authorizer for RoleAuthorizer {
    fn decide(&self, input: &AuthzInput<'_>) -> NotaryResult<Decision> {
        let actor = input.actor;
        if !actor.holds_acting_role() {
            return Ok(Decision::deny(format!(
                "user '{}' does not hold role '{}'",
                actor.user_id, actor.role
            )));
        }
        if !input.substep.roles.iter().any(|r| *r == actor.role) {
            return Ok(Decision::deny(format!(
                "role '{}' may not complete '{}'",
                actor.role, input.substep.substep_id
            )));
        }
        Ok(Decision::allow())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn decide(&self, _: &AuthzInput<'_>) -> NotaryResult<Decision> {
        Ok(Decision::allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::InputKind;

    fn substep() -> Substep {
        Substep {
            substep_id: "inspect".into(),
            title: "Inspect".into(),
            order: 1,
            roles: vec!["qa".into(), "auditor".into()],
            input_key: "ok".into(),
            input_type: InputKind::String,
            schema: None,
            ui_schema: None,
        }
    }

    fn decide(actor: &Actor) -> Decision {
        let sub = substep();
        let pid = ProcessId::new();
        RoleAuthorizer
            .decide(&AuthzInput {
                actor,
                process_id: &pid,
                workflow_key: "w",
                substep: &sub,
                step_order: 1,
                organization: None,
                sequence_ok: true,
            })
            .unwrap()
    }

    #[test]
    fn allowed_role_that_is_held() {
        let actor = Actor::new("u1", "qa", vec!["ops".into(), "qa".into()]);
        assert!(decide(&actor).allowed);
    }

    #[test]
    fn role_not_held_is_denied() {
        let actor = Actor::new("u1", "qa", vec!["ops".into()]);
        assert!(!decide(&actor).allowed);
    }

    #[test]
    fn role_not_allowed_on_substep_is_denied() {
        let actor = Actor::new("u1", "ops", vec!["ops".into()]);
        let d = decide(&actor);
        assert!(!d.allowed);
        assert!(d.reason.contains("inspect"));
    }
}
