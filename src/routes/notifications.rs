use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::Notification;
use crate::schema::notifications;
use crate::state::AppState;

const LIST_LIMIT: i64 = 50;

#[derive(Serialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub related_request_id: Option<Uuid>,
    pub is_read: bool,
    pub created_at: String,
}

impl From<Notification> for NotificationResponse {
    fn from(notification: Notification) -> Self {
        Self {
            id: notification.id,
            kind: notification.kind,
            title: notification.title,
            message: notification.message,
            related_request_id: notification.related_request_id,
            is_read: notification.is_read,
            created_at: DateTime::<Utc>::from_naive_utc_and_offset(
                notification.created_at,
                Utc,
            )
            .to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct NotificationListResponse {
    pub notifications: Vec<NotificationResponse>,
    pub unread: i64,
}

pub async fn list_notifications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<NotificationListResponse>> {
    let mut conn = state.db()?;

    let rows: Vec<Notification> = notifications::table
        .filter(notifications::user_id.eq(user.user_id))
        .order(notifications::created_at.desc())
        .limit(LIST_LIMIT)
        .load(&mut conn)?;

    let unread: i64 = notifications::table
        .filter(notifications::user_id.eq(user.user_id))
        .filter(notifications::is_read.eq(false))
        .count()
        .get_result(&mut conn)?;

    Ok(Json(NotificationListResponse {
        notifications: rows.into_iter().map(NotificationResponse::from).collect(),
        unread,
    }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let mut conn = state.db()?;

    // Scoped to the recipient so nobody can touch another user's feed.
    let updated = diesel::update(
        notifications::table
            .find(notification_id)
            .filter(notifications::user_id.eq(user.user_id)),
    )
    .set(notifications::is_read.eq(true))
    .execute(&mut conn)?;

    if updated == 0 {
        return Err(AppError::not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let mut conn = state.db()?;

    diesel::update(
        notifications::table
            .filter(notifications::user_id.eq(user.user_id))
            .filter(notifications::is_read.eq(false)),
    )
    .set(notifications::is_read.eq(true))
    .execute(&mut conn)?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let mut conn = state.db()?;

    let deleted = diesel::delete(
        notifications::table
            .find(notification_id)
            .filter(notifications::user_id.eq(user.user_id)),
    )
    .execute(&mut conn)?;

    if deleted == 0 {
        return Err(AppError::not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}
