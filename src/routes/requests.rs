use std::collections::{HashMap, HashSet};

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use diesel::dsl::count_star;
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::lifecycle::{
    self, can_claim, can_create, can_modify_request, can_release, can_view, is_valid_analysis_type,
    validate_transition, Priority, RequestStatus, Role, FILE_CATEGORY_REPORT,
};
use crate::models::{AnalysisRequest, NewAnalysisRequest, User};
use crate::notify;
use crate::schema::{request_files, requests, users};
use crate::state::AppState;

const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 2000;
const MAX_CAR_MODEL_LEN: usize = 100;

#[derive(Deserialize)]
pub struct CreateRequestPayload {
    pub title: String,
    pub description: String,
    pub car_model: String,
    pub analysis_type: String,
    #[serde(default)]
    pub priority: Option<String>,
    pub requested_deadline: NaiveDate,
}

#[derive(Deserialize, Default)]
pub struct UpdateRequestPayload {
    pub title: Option<String>,
    pub description: Option<String>,
    pub car_model: Option<String>,
    pub analysis_type: Option<String>,
    pub priority: Option<String>,
    pub requested_deadline: Option<NaiveDate>,
}

#[derive(Deserialize, Default)]
pub struct ClaimPayload {
    /// Admin-only: assign someone other than the caller.
    pub assignee_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct TransitionPayload {
    pub status: String,
}

#[derive(Serialize, Clone)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub role: String,
}

impl From<User> for UserSummary {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            full_name: user.full_name,
            role: user.role,
        }
    }
}

#[derive(Serialize)]
pub struct RequestResponse {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub car_model: String,
    pub analysis_type: String,
    pub priority: String,
    pub status: String,
    pub requested_deadline: NaiveDate,
    pub requester_id: Uuid,
    pub assignee_id: Option<Uuid>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_report: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester: Option<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserSummary>,
}

#[derive(Serialize)]
pub struct RequestDetailResponse {
    pub request: RequestResponse,
}

#[derive(Serialize)]
pub struct RequestListResponse {
    pub requests: Vec<RequestResponse>,
}

#[derive(Serialize)]
pub struct StatusCountsResponse {
    pub total: i64,
    pub pending: i64,
    pub assigned: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub cancelled: i64,
}

fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

fn to_response(
    request: AnalysisRequest,
    has_report: Option<bool>,
    profiles: &HashMap<Uuid, UserSummary>,
) -> RequestResponse {
    let requester = profiles.get(&request.requester_id).cloned();
    let assignee = request
        .assignee_id
        .and_then(|id| profiles.get(&id).cloned());
    RequestResponse {
        id: request.id,
        title: request.title,
        description: request.description,
        car_model: request.car_model,
        analysis_type: request.analysis_type,
        priority: request.priority,
        status: request.status,
        requested_deadline: request.requested_deadline,
        requester_id: request.requester_id,
        assignee_id: request.assignee_id,
        created_at: to_iso(request.created_at),
        updated_at: to_iso(request.updated_at),
        has_report,
        requester,
        assignee,
    }
}

fn load_profiles(
    conn: &mut PgConnection,
    rows: &[AnalysisRequest],
) -> AppResult<HashMap<Uuid, UserSummary>> {
    let mut ids: HashSet<Uuid> = HashSet::new();
    for row in rows {
        ids.insert(row.requester_id);
        if let Some(assignee) = row.assignee_id {
            ids.insert(assignee);
        }
    }
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let id_list: Vec<Uuid> = ids.into_iter().collect();
    let profiles: Vec<User> = users::table
        .filter(users::id.eq_any(&id_list))
        .load(conn)?;
    Ok(profiles
        .into_iter()
        .map(|user| (user.id, UserSummary::from(user)))
        .collect())
}

/// The visibility rule of the role model, pushed into the query itself so
/// an authorization slip elsewhere cannot leak other requesters' rows.
fn visible_requests(
    user: &AuthenticatedUser,
) -> requests::BoxedQuery<'static, diesel::pg::Pg> {
    let query = requests::table.into_boxed();
    match user.role {
        Role::Admin => query,
        Role::Analyst => query.filter(
            requests::assignee_id
                .is_null()
                .or(requests::assignee_id.eq(user.user_id)),
        ),
        Role::Designer => query.filter(requests::requester_id.eq(user.user_id)),
    }
}

pub async fn list_requests(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<RequestListResponse>> {
    let mut conn = state.db()?;

    let rows: Vec<AnalysisRequest> = visible_requests(&user)
        .order(requests::created_at.desc())
        .load(&mut conn)?;

    let profiles = load_profiles(&mut conn, &rows)?;

    // One grouped pass for the has_report flag instead of a query per row.
    let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
    let report_counts: Vec<(Uuid, i64)> = request_files::table
        .filter(request_files::request_id.eq_any(&ids))
        .filter(request_files::file_category.eq(FILE_CATEGORY_REPORT))
        .group_by(request_files::request_id)
        .select((request_files::request_id, count_star()))
        .load(&mut conn)?;
    let with_report: HashSet<Uuid> = report_counts.into_iter().map(|(id, _)| id).collect();

    let responses = rows
        .into_iter()
        .map(|row| {
            let has_report = with_report.contains(&row.id);
            to_response(row, Some(has_report), &profiles)
        })
        .collect();

    Ok(Json(RequestListResponse {
        requests: responses,
    }))
}

pub async fn create_request(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateRequestPayload>,
) -> AppResult<(StatusCode, Json<RequestDetailResponse>)> {
    if !can_create(user.role) {
        return Err(AppError::forbidden("only designers may file requests"));
    }

    let title = validated_text(&payload.title, "title", MAX_TITLE_LEN)?;
    let description = validated_text(&payload.description, "description", MAX_DESCRIPTION_LEN)?;
    let car_model = validated_text(&payload.car_model, "car_model", MAX_CAR_MODEL_LEN)?;
    let analysis_type = validated_analysis_type(&payload.analysis_type)?;
    let priority = match payload.priority.as_deref() {
        None => Priority::Medium,
        Some(raw) => Priority::parse(raw)
            .ok_or_else(|| AppError::bad_request(format!("invalid priority '{raw}'")))?,
    };

    let new_request = NewAnalysisRequest {
        id: Uuid::new_v4(),
        title,
        description,
        car_model,
        analysis_type,
        priority: priority.as_str().to_string(),
        status: RequestStatus::Pending.as_str().to_string(),
        requested_deadline: payload.requested_deadline,
        requester_id: user.user_id,
    };

    let mut conn = state.db()?;
    diesel::insert_into(requests::table)
        .values(&new_request)
        .execute(&mut conn)?;

    let row: AnalysisRequest = requests::table.find(new_request.id).first(&mut conn)?;
    info!(request_id = %row.id, requester_id = %user.user_id, "analysis request created");

    let profiles = load_profiles(&mut conn, std::slice::from_ref(&row))?;
    Ok((
        StatusCode::CREATED,
        Json(RequestDetailResponse {
            request: to_response(row, None, &profiles),
        }),
    ))
}

pub async fn get_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<RequestDetailResponse>> {
    let mut conn = state.db()?;

    let row: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;
    if !can_view(&user.actor(), row.requester_id, row.assignee_id) {
        // Invisible rows read as absent, matching the list filter.
        return Err(AppError::not_found());
    }

    let has_report: i64 = request_files::table
        .filter(request_files::request_id.eq(request_id))
        .filter(request_files::file_category.eq(FILE_CATEGORY_REPORT))
        .select(count_star())
        .first(&mut conn)?;

    let profiles = load_profiles(&mut conn, std::slice::from_ref(&row))?;
    Ok(Json(RequestDetailResponse {
        request: to_response(row, Some(has_report > 0), &profiles),
    }))
}

pub async fn update_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateRequestPayload>,
) -> AppResult<Json<RequestDetailResponse>> {
    let mut conn = state.db()?;

    let existing: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;
    if !can_modify_request(&user.actor(), existing.requester_id, existing.assignee_id) {
        return Err(AppError::forbidden("not allowed to edit this request"));
    }

    let title = payload
        .title
        .as_deref()
        .map(|value| validated_text(value, "title", MAX_TITLE_LEN))
        .transpose()?;
    let description = payload
        .description
        .as_deref()
        .map(|value| validated_text(value, "description", MAX_DESCRIPTION_LEN))
        .transpose()?;
    let car_model = payload
        .car_model
        .as_deref()
        .map(|value| validated_text(value, "car_model", MAX_CAR_MODEL_LEN))
        .transpose()?;
    let analysis_type = payload
        .analysis_type
        .as_deref()
        .map(validated_analysis_type)
        .transpose()?;
    let priority = payload
        .priority
        .as_deref()
        .map(|raw| {
            Priority::parse(raw)
                .ok_or_else(|| AppError::bad_request(format!("invalid priority '{raw}'")))
        })
        .transpose()?;

    if title.is_none()
        && description.is_none()
        && car_model.is_none()
        && analysis_type.is_none()
        && priority.is_none()
        && payload.requested_deadline.is_none()
    {
        return Err(AppError::bad_request("no changes provided"));
    }

    let changeset = RequestChangeset {
        title,
        description,
        car_model,
        analysis_type,
        priority: priority.map(|value| value.as_str().to_string()),
        requested_deadline: payload.requested_deadline,
        updated_at: Utc::now().naive_utc(),
    };

    diesel::update(requests::table.find(request_id))
        .set(&changeset)
        .execute(&mut conn)?;

    let row: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;
    let profiles = load_profiles(&mut conn, std::slice::from_ref(&row))?;
    Ok(Json(RequestDetailResponse {
        request: to_response(row, None, &profiles),
    }))
}

pub async fn delete_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    if !user.actor().is_admin() {
        return Err(AppError::forbidden("only admins may delete requests"));
    }

    let mut conn = state.db()?;
    let existing: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;

    let file_paths: Vec<String> = request_files::table
        .filter(request_files::request_id.eq(request_id))
        .select(request_files::file_path)
        .load(&mut conn)?;

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::delete(request_files::table.filter(request_files::request_id.eq(request_id)))
            .execute(conn)?;
        diesel::delete(requests::table.find(existing.id)).execute(conn)?;
        Ok(())
    })?;

    drop(conn);

    // Best-effort storage cleanup: the rows are already gone, so a failed
    // object delete is logged and the operation still succeeds.
    for path in file_paths {
        if let Err(err) = state.storage.delete_object(&path).await {
            warn!(request_id = %request_id, key = %path, error = %err, "orphaned storage object after request delete");
        }
    }

    info!(request_id = %request_id, admin_id = %user.user_id, "analysis request deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn claim_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    user: AuthenticatedUser,
    payload: Option<Json<ClaimPayload>>,
) -> AppResult<Json<RequestDetailResponse>> {
    if !can_claim(user.role) {
        return Err(AppError::forbidden("only analysts may claim requests"));
    }

    let assignee_id = match payload.and_then(|Json(body)| body.assignee_id) {
        Some(explicit) if explicit != user.user_id => {
            if !user.actor().is_admin() {
                return Err(AppError::forbidden(
                    "only admins may assign someone else",
                ));
            }
            explicit
        }
        _ => user.user_id,
    };

    let mut conn = state.db()?;
    let existing: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;

    if assignee_id != user.user_id {
        let target_exists: i64 = users::table
            .filter(users::id.eq(assignee_id))
            .select(count_star())
            .first(&mut conn)?;
        if target_exists == 0 {
            return Err(AppError::bad_request("assignee does not exist"));
        }
    }

    // Optimistic claim: losers of the race see the winner on re-read and
    // get a conflict rather than silently stealing the assignment.
    if let Some(current) = existing.assignee_id {
        if current != assignee_id {
            return Err(AppError::conflict(
                "request is already claimed by another analyst",
            ));
        }
        // Idempotent re-claim by the current holder.
        let profiles = load_profiles(&mut conn, std::slice::from_ref(&existing))?;
        return Ok(Json(RequestDetailResponse {
            request: to_response(existing, None, &profiles),
        }));
    }

    let now = Utc::now().naive_utc();
    let new_status = if existing.status == RequestStatus::Pending.as_str() {
        RequestStatus::Assigned.as_str().to_string()
    } else {
        existing.status.clone()
    };

    diesel::update(requests::table.find(request_id))
        .set((
            requests::assignee_id.eq(Some(assignee_id)),
            requests::status.eq(&new_status),
            requests::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    let row: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;
    info!(request_id = %row.id, assignee_id = %assignee_id, actor_id = %user.user_id, "request claimed");

    notify::emit(
        &mut conn,
        notify::assignment_notifications(
            row.id,
            &row.title,
            row.requester_id,
            assignee_id,
            user.user_id,
        ),
    );

    let profiles = load_profiles(&mut conn, std::slice::from_ref(&row))?;
    Ok(Json(RequestDetailResponse {
        request: to_response(row, None, &profiles),
    }))
}

pub async fn release_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<RequestDetailResponse>> {
    if !can_claim(user.role) {
        return Err(AppError::forbidden("only analysts may release requests"));
    }

    let mut conn = state.db()?;
    let existing: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;

    if !can_release(&user.actor(), existing.assignee_id) {
        return Err(AppError::forbidden(
            "only the current assignee may release this request",
        ));
    }

    // Releasing always restarts the workflow, whatever state it was in.
    let now = Utc::now().naive_utc();
    diesel::update(requests::table.find(request_id))
        .set((
            requests::assignee_id.eq(None::<Uuid>),
            requests::status.eq(RequestStatus::Pending.as_str()),
            requests::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    let row: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;
    info!(request_id = %row.id, actor_id = %user.user_id, "request released back to pending");

    let profiles = load_profiles(&mut conn, std::slice::from_ref(&row))?;
    Ok(Json(RequestDetailResponse {
        request: to_response(row, None, &profiles),
    }))
}

pub async fn transition_status(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<TransitionPayload>,
) -> AppResult<Json<RequestDetailResponse>> {
    let target = RequestStatus::parse(&payload.status)
        .ok_or_else(|| AppError::bad_request(format!("invalid status '{}'", payload.status)))?;

    let mut conn = state.db()?;
    let existing: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;

    // Authorization comes first; the transition table is never consulted
    // for callers without standing.
    if !can_modify_request(&user.actor(), existing.requester_id, existing.assignee_id) {
        return Err(AppError::forbidden(
            "not allowed to change this request's status",
        ));
    }

    let current = RequestStatus::parse(&existing.status)
        .ok_or_else(|| AppError::internal(format!("corrupt status '{}'", existing.status)))?;

    validate_transition(current, target)
        .map_err(|err| AppError::bad_request(err.to_string()))?;

    let now = Utc::now().naive_utc();
    diesel::update(requests::table.find(request_id))
        .set((
            requests::status.eq(target.as_str()),
            requests::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    let row: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;
    info!(
        request_id = %row.id,
        from = current.as_str(),
        to = target.as_str(),
        actor_id = %user.user_id,
        "request status changed"
    );

    notify::emit(
        &mut conn,
        notify::status_change_notifications(
            row.id,
            &row.title,
            row.requester_id,
            row.assignee_id,
            user.user_id,
            target,
        ),
    );

    let profiles = load_profiles(&mut conn, std::slice::from_ref(&row))?;
    Ok(Json(RequestDetailResponse {
        request: to_response(row, None, &profiles),
    }))
}

pub async fn status_counts(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<StatusCountsResponse>> {
    let mut conn = state.db()?;

    let rows: Vec<AnalysisRequest> = visible_requests(&user).load(&mut conn)?;

    let mut counts: HashMap<&str, i64> = HashMap::new();
    for row in &rows {
        *counts.entry(row.status.as_str()).or_insert(0) += 1;
    }
    let get = |status: RequestStatus| counts.get(status.as_str()).copied().unwrap_or(0);

    Ok(Json(StatusCountsResponse {
        total: rows.len() as i64,
        pending: get(RequestStatus::Pending),
        assigned: get(RequestStatus::Assigned),
        in_progress: get(RequestStatus::InProgress),
        completed: get(RequestStatus::Completed),
        cancelled: get(RequestStatus::Cancelled),
    }))
}

fn validated_text(value: &str, field: &str, max_len: usize) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > max_len {
        return Err(AppError::bad_request(format!(
            "{field} must be at most {max_len} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn validated_analysis_type(value: &str) -> AppResult<String> {
    let normalized = value.trim().to_lowercase();
    if !is_valid_analysis_type(&normalized) {
        return Err(AppError::bad_request(format!(
            "invalid analysis type '{value}'. Allowed types: {}",
            lifecycle::ANALYSIS_TYPES.join(", ")
        )));
    }
    Ok(normalized)
}

#[derive(AsChangeset)]
#[diesel(table_name = requests)]
struct RequestChangeset {
    title: Option<String>,
    description: Option<String>,
    car_model: Option<String>,
    analysis_type: Option<String>,
    priority: Option<String>,
    requested_deadline: Option<NaiveDate>,
    updated_at: NaiveDateTime,
}
