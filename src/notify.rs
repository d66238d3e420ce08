//! Notification fan-out for request lifecycle events.
//!
//! The recipient computation is a pure function shared by the assignment
//! and status-transition handlers. Emission is fire-and-forget: a failed
//! insert is logged and must never fail the mutation that triggered it.

use diesel::prelude::*;
use diesel::PgConnection;
use tracing::warn;
use uuid::Uuid;

use crate::lifecycle::RequestStatus;
use crate::models::NewNotification;
use crate::schema::notifications;

pub const KIND_REQUEST_ASSIGNED: &str = "request_assigned";
pub const KIND_REQUEST_UPDATED: &str = "request_updated";
pub const KIND_REQUEST_COMPLETED: &str = "request_completed";

/// Everyone attached to the request except the acting user, deduplicated.
/// The requester and assignee are not required to be distinct people; if
/// they coincide the recipient appears once.
pub fn recipients(requester_id: Uuid, assignee_id: Option<Uuid>, actor_id: Uuid) -> Vec<Uuid> {
    let mut out = Vec::with_capacity(2);
    if requester_id != actor_id {
        out.push(requester_id);
    }
    if let Some(assignee) = assignee_id {
        if assignee != actor_id && !out.contains(&assignee) {
            out.push(assignee);
        }
    }
    out
}

pub fn kind_for_status(new_status: RequestStatus) -> &'static str {
    if new_status == RequestStatus::Completed {
        KIND_REQUEST_COMPLETED
    } else {
        KIND_REQUEST_UPDATED
    }
}

pub fn status_change_notifications(
    request_id: Uuid,
    request_title: &str,
    requester_id: Uuid,
    assignee_id: Option<Uuid>,
    actor_id: Uuid,
    new_status: RequestStatus,
) -> Vec<NewNotification> {
    recipients(requester_id, assignee_id, actor_id)
        .into_iter()
        .map(|user_id| NewNotification {
            id: Uuid::new_v4(),
            user_id,
            kind: kind_for_status(new_status).to_string(),
            title: "Request status changed".to_string(),
            message: format!(
                "Status of \"{}\" changed to \"{}\".",
                request_title,
                new_status.as_str()
            ),
            related_request_id: Some(request_id),
            is_read: false,
        })
        .collect()
}

pub fn assignment_notifications(
    request_id: Uuid,
    request_title: &str,
    requester_id: Uuid,
    assignee_id: Uuid,
    actor_id: Uuid,
) -> Vec<NewNotification> {
    recipients(requester_id, Some(assignee_id), actor_id)
        .into_iter()
        .map(|user_id| NewNotification {
            id: Uuid::new_v4(),
            user_id,
            kind: KIND_REQUEST_ASSIGNED.to_string(),
            title: "Request assigned".to_string(),
            message: format!("\"{}\" now has an assigned analyst.", request_title),
            related_request_id: Some(request_id),
            is_read: false,
        })
        .collect()
}

/// Best-effort insert. Failures are logged, never propagated.
pub fn emit(conn: &mut PgConnection, batch: Vec<NewNotification>) {
    if batch.is_empty() {
        return;
    }
    if let Err(err) = diesel::insert_into(notifications::table)
        .values(&batch)
        .execute(conn)
    {
        warn!(error = %err, count = batch.len(), "failed to emit notifications");
    }
}
