use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<String>,
    pub is_active: bool,
    pub is_verified: bool,
    pub verification_token: Option<String>,
    pub password_reset_token: Option<String>,
    pub password_reset_expires: Option<NaiveDateTime>,
    pub last_login: Option<NaiveDateTime>,
    pub login_attempts: i32,
    pub locked_until: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<String>,
    pub is_verified: bool,
    pub verification_token: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = calls)]
pub struct Call {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub is_open: bool,
    pub status: String,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub category: Option<String>,
    pub max_applications: Option<i32>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = calls)]
pub struct NewCall {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub is_open: bool,
    pub status: String,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub category: Option<String>,
    pub max_applications: Option<i32>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(table_name = document_definitions)]
#[diesel(belongs_to(Call))]
pub struct DocumentDefinition {
    pub id: Uuid,
    pub call_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub allowed_formats: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_definitions)]
pub struct NewDocumentDefinition {
    pub id: Uuid,
    pub call_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub allowed_formats: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(table_name = applications)]
#[diesel(belongs_to(Call))]
pub struct Application {
    pub id: Uuid,
    pub user_id: Uuid,
    pub call_id: Uuid,
    pub content: String,
    pub status: String,
    pub documents_confirmed: bool,
    pub submitted_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = applications)]
pub struct NewApplication {
    pub id: Uuid,
    pub user_id: Uuid,
    pub call_id: Uuid,
    pub content: String,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(table_name = attachments)]
#[diesel(belongs_to(Application))]
pub struct Attachment {
    pub id: Uuid,
    pub application_id: Uuid,
    pub document_id: Option<Uuid>,
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    #[serde(skip_serializing)]
    pub storage_key: String,
    pub is_confirmed: bool,
    pub uploaded_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = attachments)]
pub struct NewAttachment {
    pub id: Uuid,
    pub application_id: Uuid,
    pub document_id: Option<Uuid>,
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub storage_key: String,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize)]
#[diesel(table_name = application_reviewers)]
pub struct ApplicationReviewer {
    pub application_id: Uuid,
    pub user_id: Uuid,
    pub slot: i16,
    pub assigned_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = reviews)]
pub struct Review {
    pub id: Uuid,
    pub application_id: Uuid,
    pub reviewer_id: Uuid,
    pub score: i32,
    pub comment: Option<String>,
    pub submitted_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = reviews)]
pub struct NewReview {
    pub id: Uuid,
    pub application_id: Uuid,
    pub reviewer_id: Uuid,
    pub score: i32,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize)]
#[diesel(table_name = call_reviewers)]
pub struct CallReviewer {
    pub call_id: Uuid,
    pub reviewer_id: Uuid,
    pub added_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = reviewer_invites)]
pub struct ReviewerInvite {
    pub id: Uuid,
    pub call_id: Uuid,
    pub email: String,
    pub token: String,
    pub expires_at: NaiveDateTime,
    pub used: bool,
    pub used_at: Option<NaiveDateTime>,
    pub used_by: Option<Uuid>,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = reviewer_invites)]
pub struct NewReviewerInvite {
    pub id: Uuid,
    pub call_id: Uuid,
    pub email: String,
    pub token: String,
    pub expires_at: NaiveDateTime,
    pub created_by: Option<Uuid>,
}
