use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub password_hash: String,
    pub role: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub password_hash: String,
    pub role: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = requests)]
#[diesel(belongs_to(User, foreign_key = requester_id))]
pub struct AnalysisRequest {
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
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = requests)]
pub struct NewAnalysisRequest {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub car_model: String,
    pub analysis_type: String,
    pub priority: String,
    pub status: String,
    pub requested_deadline: NaiveDate,
    pub requester_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = request_files)]
#[diesel(belongs_to(AnalysisRequest, foreign_key = request_id))]
pub struct RequestFile {
    pub id: Uuid,
    pub request_id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
    pub file_category: String,
    pub uploaded_by: Uuid,
    pub metadata: serde_json::Value,
    pub uploaded_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = request_files)]
pub struct NewRequestFile {
    pub id: Uuid,
    pub request_id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
    pub file_category: String,
    pub uploaded_by: Uuid,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = notifications)]
#[diesel(belongs_to(User, foreign_key = user_id))]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub related_request_id: Option<Uuid>,
    pub is_read: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub related_request_id: Option<Uuid>,
    pub is_read: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = refresh_tokens)]
#[diesel(belongs_to(User))]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = refresh_tokens)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}
