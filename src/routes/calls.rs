use axum::{
    extract::{Path, Query, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    Json,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::{AuthenticatedUser, Role},
    error::{AppError, AppResult},
    export::{self, ExportError},
    models::{Application, Call, DocumentDefinition},
    state::AppState,
    workflow::{
        applications as application_flow,
        calls::{self as call_flow, CallInput, DefinitionInput},
    },
};

use super::release_blobs;

const DEFAULT_PAGE_SIZE: i64 = 100;

#[derive(Deserialize)]
pub struct DefinitionPayload {
    pub name: String,
    pub description: Option<String>,
    pub allowed_formats: String,
}

impl From<DefinitionPayload> for DefinitionInput {
    fn from(value: DefinitionPayload) -> Self {
        DefinitionInput {
            name: value.name,
            description: value.description,
            allowed_formats: value.allowed_formats,
        }
    }
}

#[derive(Deserialize)]
pub struct CallPayload {
    pub title: String,
    pub description: Option<String>,
    #[serde(default = "default_is_open")]
    pub is_open: bool,
    #[serde(default = "default_status")]
    pub status: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub max_applications: Option<i32>,
    #[serde(default)]
    pub document_definitions: Vec<DefinitionPayload>,
}

const fn default_is_open() -> bool {
    true
}

fn default_status() -> String {
    call_flow::STATUS_DRAFT.to_string()
}

impl CallPayload {
    fn split(self) -> (CallInput, Vec<DefinitionInput>) {
        let input = CallInput {
            title: self.title,
            description: self.description,
            is_open: self.is_open,
            status: self.status,
            start_date: self.start_date.map(|at| at.naive_utc()),
            end_date: self.end_date.map(|at| at.naive_utc()),
            category: self.category,
            max_applications: self.max_applications,
        };
        let definitions = self
            .document_definitions
            .into_iter()
            .map(DefinitionInput::from)
            .collect();
        (input, definitions)
    }
}

#[derive(Deserialize)]
pub struct CallListQuery {
    #[serde(default)]
    pub only_open: bool,
    #[serde(default)]
    pub skip: i64,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct CallResponse {
    #[serde(flatten)]
    pub call: Call,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_definitions: Option<Vec<DocumentDefinition>>,
}

fn to_response(
    call: Call,
    definitions: Option<Vec<DocumentDefinition>>,
    now: NaiveDateTime,
) -> CallResponse {
    CallResponse {
        is_active: call_flow::is_active(&call, now),
        call,
        document_definitions: definitions,
    }
}

pub async fn list_calls(
    State(state): State<AppState>,
    Query(query): Query<CallListQuery>,
) -> AppResult<Json<Vec<CallResponse>>> {
    let now = Utc::now().naive_utc();
    let mut conn = state.db()?;
    let calls = call_flow::list_calls(
        &mut conn,
        query.only_open,
        query.skip,
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        now,
    )?;
    Ok(Json(
        calls
            .into_iter()
            .map(|call| to_response(call, None, now))
            .collect(),
    ))
}

pub async fn get_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
) -> AppResult<Json<CallResponse>> {
    let mut conn = state.db()?;
    let call = call_flow::get_call(&mut conn, call_id)?;
    let definitions = call_flow::list_definitions(&mut conn, call_id)?;
    Ok(Json(to_response(call, Some(definitions), Utc::now().naive_utc())))
}

pub async fn create_call(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CallPayload>,
) -> AppResult<(StatusCode, Json<CallResponse>)> {
    user.require(&[Role::Admin])?;
    let (input, definitions) = payload.split();

    let mut conn = state.db()?;
    let (call, definitions) = call_flow::create_call(&mut conn, input, definitions)?;
    tracing::info!(call_id = %call.id, definitions = definitions.len(), "created call");
    Ok((
        StatusCode::CREATED,
        Json(to_response(call, Some(definitions), Utc::now().naive_utc())),
    ))
}

/// Full replacement of the editable fields; definitions are managed through
/// the admin document routes.
pub async fn update_call(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(call_id): Path<Uuid>,
    Json(payload): Json<CallPayload>,
) -> AppResult<Json<CallResponse>> {
    user.require(&[Role::Admin])?;
    let (input, _) = payload.split();

    let mut conn = state.db()?;
    let call = call_flow::update_call(&mut conn, call_id, input)?;
    let definitions = call_flow::list_definitions(&mut conn, call_id)?;
    Ok(Json(to_response(call, Some(definitions), Utc::now().naive_utc())))
}

pub async fn delete_call(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    user.require(&[Role::Admin])?;
    let keys = {
        let mut conn = state.db()?;
        call_flow::delete_call(&mut conn, call_id)?
    };
    tracing::info!(%call_id, attachments = keys.len(), "deleted call");
    release_blobs(&state, keys).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_documents(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<Json<Vec<DocumentDefinition>>> {
    let mut conn = state.db()?;
    Ok(Json(call_flow::list_definitions(&mut conn, call_id)?))
}

pub async fn add_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(call_id): Path<Uuid>,
    Json(payload): Json<DefinitionPayload>,
) -> AppResult<(StatusCode, Json<DocumentDefinition>)> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    let definition = call_flow::add_definition(&mut conn, call_id, payload.into())?;
    Ok((StatusCode::CREATED, Json(definition)))
}

pub async fn update_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((call_id, doc_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<DefinitionPayload>,
) -> AppResult<Json<DocumentDefinition>> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    Ok(Json(call_flow::update_definition(
        &mut conn,
        call_id,
        doc_id,
        payload.into(),
    )?))
}

pub async fn delete_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((call_id, doc_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    call_flow::delete_definition(&mut conn, call_id, doc_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Admins, or reviewers linked to the call.
pub async fn list_call_applications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<Json<Vec<Application>>> {
    user.require(&[Role::Admin, Role::Reviewer])?;
    let mut conn = state.db()?;
    if user.role == Role::Reviewer && !call_flow::is_call_reviewer(&mut conn, call_id, user.user_id)? {
        return Err(AppError::forbidden("not a reviewer for this call"));
    }
    Ok(Json(application_flow::list_for_call(&mut conn, call_id)?))
}

pub async fn export_applications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<(HeaderMap, Vec<u8>)> {
    user.require(&[Role::Admin])?;
    let (call, rows) = {
        let mut conn = state.db()?;
        call_flow::export_rows(&mut conn, call_id)?
    };

    let title = format!("Applications for {}", call.title);
    let rendered =
        tokio::task::spawn_blocking(move || export::render_applications_pdf(&title, &rows)).await?;
    let pdf = match rendered {
        Ok(bytes) => bytes,
        Err(ExportError::RendererUnavailable) => {
            tracing::warn!(%call_id, "pdf renderer unavailable");
            return Err(AppError::unavailable("pdf export is not available"));
        }
        Err(err) => return Err(AppError::internal(err)),
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
    let disposition = format!("attachment; filename=\"call-{call_id}-applications.pdf\"");
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).map_err(AppError::internal)?,
    );
    Ok((headers, pdf))
}
