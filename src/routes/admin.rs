use axum::extract::{Json, Path, State};
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::lifecycle::Role;
use crate::models::User;
use crate::routes::auth::ProfileResponse;
use crate::schema::users;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub role: Option<String>,
}

#[derive(serde::Serialize)]
pub struct UserListResponse {
    pub users: Vec<ProfileResponse>,
}

fn require_admin(user: &AuthenticatedUser) -> AppResult<()> {
    if user.role != Role::Admin {
        return Err(AppError::forbidden("admin privileges required"));
    }
    Ok(())
}

pub async fn list_users(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UserListResponse>> {
    require_admin(&user)?;

    let mut conn = state.db()?;
    let rows: Vec<User> = users::table
        .order(users::created_at.desc())
        .load(&mut conn)?;

    Ok(Json(UserListResponse {
        users: rows.into_iter().map(ProfileResponse::from).collect(),
    }))
}

/// The only path that changes a profile's role. Self-service profile
/// updates never touch it.
pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateUserRequest>,
) -> AppResult<Json<ProfileResponse>> {
    require_admin(&user)?;

    let mut conn = state.db()?;
    let target: User = users::table.find(user_id).first(&mut conn)?;

    let email = match payload.email.as_deref().map(str::trim) {
        None => None,
        Some(value) if value.is_empty() || !value.contains('@') => {
            return Err(AppError::bad_request("a valid email address is required"));
        }
        Some(value) => Some(value.to_lowercase()),
    };

    let role = payload
        .role
        .as_deref()
        .map(|value| {
            Role::parse(value)
                .ok_or_else(|| AppError::bad_request(format!("invalid role '{value}'")))
        })
        .transpose()?;

    let full_name = payload
        .full_name
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if email.is_none() && role.is_none() && full_name.is_none() {
        return Err(AppError::bad_request("no changes provided"));
    }

    let now = Utc::now().naive_utc();
    let result = diesel::update(users::table.find(target.id))
        .set((
            email.clone().map(|value| users::email.eq(value)),
            full_name.clone().map(|value| users::full_name.eq(value)),
            role.map(|value| users::role.eq(value.as_str())),
            users::updated_at.eq(now),
        ))
        .execute(&mut conn);

    match result {
        Ok(_) => {}
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => {
            return Err(AppError::bad_request("email is already registered"));
        }
        Err(err) => return Err(AppError::from(err)),
    }

    if let Some(new_role) = role {
        if new_role.as_str() != target.role {
            info!(
                target_id = %target.id,
                from = %target.role,
                to = new_role.as_str(),
                admin_id = %user.user_id,
                "user role changed"
            );
        }
    }

    let updated: User = users::table.find(target.id).first(&mut conn)?;
    Ok(Json(ProfileResponse::from(updated)))
}
