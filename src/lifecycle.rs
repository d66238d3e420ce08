//! Request lifecycle rules: the status transition table and the
//! role/ownership predicates that gate every mutating operation.
//!
//! Everything here is a pure function over an explicit [`Actor`]; handlers
//! read the row, consult these rules, then conditionally write.

use thiserror::Error;
use uuid::Uuid;

/// Closed role vocabulary. Unknown role strings are mapped to `Designer`
/// at the authentication boundary and never reach these predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Designer,
    Analyst,
    Admin,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "designer" => Some(Role::Designer),
            "analyst" => Some(Role::Analyst),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Designer => "designer",
            Role::Analyst => "analyst",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl RequestStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RequestStatus::Pending),
            "assigned" => Some(RequestStatus::Assigned),
            "in_progress" => Some(RequestStatus::InProgress),
            "completed" => Some(RequestStatus::Completed),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Assigned => "assigned",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

pub const ANALYSIS_TYPES: &[&str] = &[
    "structural",
    "thermal",
    "flow",
    "vibration",
    "crash",
    "other",
];

pub fn is_valid_analysis_type(value: &str) -> bool {
    ANALYSIS_TYPES.iter().any(|allowed| *allowed == value)
}

/// The authenticated caller as seen by the lifecycle rules.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Uuid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot change status from {} to {}", .from.as_str(), .to.as_str())]
pub struct IllegalTransition {
    pub from: RequestStatus,
    pub to: RequestStatus,
}

/// Legal next statuses for each current status. `cancelled` is a declared
/// state with no wired transitions in or out; any attempt to enter or
/// leave it is rejected here.
pub fn allowed_transitions(from: RequestStatus) -> &'static [RequestStatus] {
    match from {
        RequestStatus::Pending => &[RequestStatus::Assigned],
        RequestStatus::Assigned => &[RequestStatus::InProgress, RequestStatus::Pending],
        RequestStatus::InProgress => &[RequestStatus::Completed, RequestStatus::Assigned],
        RequestStatus::Completed => &[RequestStatus::InProgress],
        RequestStatus::Cancelled => &[],
    }
}

/// The single place every status change is checked against the table.
pub fn validate_transition(
    from: RequestStatus,
    to: RequestStatus,
) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

pub fn transition_allowed(from: RequestStatus, to: RequestStatus) -> bool {
    validate_transition(from, to).is_ok()
}

/// Visibility rule, also used to scope list queries at the data-access
/// boundary: designers see their own requests, analysts see the unclaimed
/// pool plus their own assignments, admins see everything.
pub fn can_view(actor: &Actor, requester_id: Uuid, assignee_id: Option<Uuid>) -> bool {
    match actor.role {
        Role::Admin => true,
        Role::Analyst => assignee_id.is_none() || assignee_id == Some(actor.id),
        Role::Designer => requester_id == actor.id,
    }
}

/// Only designers file analysis requests; admins may act on their behalf.
pub fn can_create(role: Role) -> bool {
    matches!(role, Role::Designer | Role::Admin)
}

/// Role gate for claiming; whether the assignment is actually free is a
/// separate state check against the current assignee.
pub fn can_claim(role: Role) -> bool {
    matches!(role, Role::Analyst | Role::Admin)
}

pub fn can_release(actor: &Actor, assignee_id: Option<Uuid>) -> bool {
    match actor.role {
        Role::Admin => true,
        Role::Analyst => assignee_id == Some(actor.id),
        Role::Designer => false,
    }
}

/// Shared authorization for status transitions, field edits and uploads:
/// admin, the designer who filed the request, or the analyst assigned to it.
pub fn can_modify_request(actor: &Actor, requester_id: Uuid, assignee_id: Option<Uuid>) -> bool {
    match actor.role {
        Role::Admin => true,
        Role::Designer => requester_id == actor.id,
        Role::Analyst => assignee_id == Some(actor.id),
    }
}

/// Downloads are open to any participant regardless of role.
pub fn can_download(actor: &Actor, requester_id: Uuid, assignee_id: Option<Uuid>) -> bool {
    actor.is_admin() || requester_id == actor.id || assignee_id == Some(actor.id)
}

pub const FILE_CATEGORY_REQUEST: &str = "request";
pub const FILE_CATEGORY_REPORT: &str = "report";

/// Per-file delete rule: admins always; request-input files only by the
/// designer who owns the request; report files only by the analyst who
/// uploaded that particular file.
pub fn can_delete_file(
    actor: &Actor,
    file_category: &str,
    file_uploaded_by: Uuid,
    requester_id: Uuid,
) -> bool {
    if actor.is_admin() {
        return true;
    }
    match file_category {
        FILE_CATEGORY_REQUEST => actor.role == Role::Designer && requester_id == actor.id,
        FILE_CATEGORY_REPORT => actor.role == Role::Analyst && file_uploaded_by == actor.id,
        _ => false,
    }
}
