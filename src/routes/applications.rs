use axum::{
    extract::{Multipart, Path, Query, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::{AuthenticatedUser, Role},
    db::KeyLocks,
    error::{AppError, AppResult},
    models::{Application, ApplicationReviewer, Attachment},
    notify,
    state::AppState,
    storage::{blob_key, sha256_hex},
    upload::{inline_content_disposition, validate_file, ValidatedFile},
    workflow::{
        applications::{self as flow, ApplicationError, StoredFile},
        calls as call_flow,
    },
};

use super::release_blobs;

const FILES_FIELD: &str = "files";
const DOCUMENT_ID_FIELD: &str = "document_id";

#[derive(Deserialize)]
pub struct CreateApplicationRequest {
    pub call_id: Uuid,
    #[serde(default)]
    pub content: String,
}

#[derive(Deserialize)]
pub struct UploadQuery {
    pub document_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct AssignReviewerQuery {
    pub reviewer_id: Uuid,
}

#[derive(Serialize)]
pub struct ApplicationDetail {
    #[serde(flatten)]
    pub application: Application,
    pub attachments: Vec<Attachment>,
    pub reviewer_ids: Vec<Uuid>,
}

pub async fn create_application(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateApplicationRequest>,
) -> AppResult<(StatusCode, Json<Application>)> {
    user.require(&[Role::Applicant])?;
    let mut conn = state.db()?;
    let application = flow::create_application(
        &mut conn,
        user.user_id,
        payload.call_id,
        payload.content,
        Utc::now().naive_utc(),
    )?;
    tracing::info!(application_id = %application.id, call_id = %application.call_id, "created application");
    Ok((StatusCode::CREATED, Json(application)))
}

/// Idempotent entry point: 201 on first use, 200 with the same row afterwards.
pub async fn get_or_create_for_call(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<Application>)> {
    user.require(&[Role::Applicant])?;
    let mut conn = state.db()?;
    let outcome =
        flow::get_or_create_application(&mut conn, user.user_id, call_id, Utc::now().naive_utc())?;
    let status = if outcome.created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.into_inner())))
}

pub async fn my_applications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Application>>> {
    let mut conn = state.db()?;
    Ok(Json(flow::list_for_user(&mut conn, user.user_id)?))
}

pub async fn assigned_applications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Application>>> {
    user.require(&[Role::Reviewer])?;
    let mut conn = state.db()?;
    Ok(Json(flow::list_assigned(&mut conn, user.user_id)?))
}

pub async fn get_application(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
) -> AppResult<Json<ApplicationDetail>> {
    let mut conn = state.db()?;
    let application = flow::get_application(&mut conn, application_id)?;
    flow::ensure_can_view(&mut conn, &application, user.user_id, user.role)?;
    let attachments = flow::attachments_for(&mut conn, application_id)?;
    let reviewer_ids = flow::reviewers_for(&mut conn, application_id)?;
    Ok(Json(ApplicationDetail {
        application,
        attachments,
        reviewer_ids,
    }))
}

pub async fn delete_application(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let keys = {
        let mut conn = state.db()?;
        flow::delete_application(&mut conn, application_id, user.user_id, user.role)?
    };
    tracing::info!(%application_id, attachments = keys.len(), "deleted application");
    release_blobs(&state, keys).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_attachments(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
) -> AppResult<Json<Vec<Attachment>>> {
    let mut conn = state.db()?;
    let application = flow::get_application(&mut conn, application_id)?;
    flow::ensure_can_view(&mut conn, &application, user.user_id, user.role)?;
    Ok(Json(flow::attachments_for(&mut conn, application_id)?))
}

/// Every file is validated before the first byte reaches the blob store.
pub async fn upload_attachments(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<Vec<Attachment>>)> {
    let mut raw_files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut form_document_id: Option<Uuid> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("invalid multipart body: {err}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(FILES_FIELD) | Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_request("file part is missing a filename"))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(format!("failed to read upload: {err}")))?;
                raw_files.push((file_name, bytes.to_vec()));
            }
            Some(DOCUMENT_ID_FIELD) => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("invalid document_id: {err}")))?;
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    form_document_id = Some(
                        Uuid::parse_str(trimmed)
                            .map_err(|_| AppError::bad_request("document_id must be a UUID"))?,
                    );
                }
            }
            _ => {}
        }
    }

    if raw_files.is_empty() {
        return Err(AppError::bad_request("no files uploaded"));
    }
    let document_id = query.document_id.or(form_document_id);

    let target = {
        let mut conn = state.db()?;
        flow::prepare_upload(&mut conn, application_id, user.user_id, document_id)?
    };

    let document_id = target.definition.as_ref().map(|definition| definition.id);
    let call_id = target.application.call_id;

    let max_bytes = state.config.max_upload_bytes;
    let validated = raw_files
        .into_iter()
        .map(|(name, bytes)| validate_file(&name, bytes, &target.allowed, max_bytes))
        .collect::<Result<Vec<ValidatedFile>, _>>()
        .map_err(ApplicationError::from)?;

    let files: Vec<(ValidatedFile, String)> = validated
        .into_iter()
        .map(|file| {
            let checksum = sha256_hex(&file.bytes);
            (file, checksum)
        })
        .collect();
    let keys: Vec<String> = files.iter().map(|(_, checksum)| blob_key(checksum)).collect();

    // The key locks stay held from the first blob write until the rows
    // commit, so a concurrent release cannot drop a blob this upload reuses.
    let recorded = {
        let mut conn = state.db()?;
        let mut locks = KeyLocks::acquire(&mut conn, keys.iter().map(String::as_str))?;
        store_and_record(&state, &mut locks, application_id, user.user_id, document_id, files)
            .await
    };
    match recorded {
        Ok(attachments) => {
            tracing::info!(%application_id, %call_id, files = attachments.len(), "stored attachments");
            Ok((StatusCode::CREATED, Json(attachments)))
        }
        Err(err) => {
            release_blobs(&state, keys).await;
            Err(err)
        }
    }
}

async fn store_and_record(
    state: &AppState,
    locks: &mut KeyLocks<'_>,
    application_id: Uuid,
    user_id: Uuid,
    document_id: Option<Uuid>,
    files: Vec<(ValidatedFile, String)>,
) -> AppResult<Vec<Attachment>> {
    let mut stored = Vec::with_capacity(files.len());
    for (file, checksum) in files {
        let storage_key = blob_key(&checksum);
        let size_bytes = file.bytes.len() as i64;
        state
            .storage
            .put_object(&storage_key, file.bytes)
            .await
            .map_err(AppError::internal)?;
        stored.push(StoredFile {
            original_name: file.original_name,
            content_type: file.content_type,
            size_bytes,
            checksum,
            storage_key,
        });
    }
    Ok(flow::record_attachments(
        locks.conn(),
        application_id,
        user_id,
        document_id,
        stored,
    )?)
}

pub async fn download_attachment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(attachment_id): Path<Uuid>,
) -> AppResult<(HeaderMap, Vec<u8>)> {
    let attachment = {
        let mut conn = state.db()?;
        let attachment = flow::get_attachment(&mut conn, attachment_id)?;
        let application = flow::get_application(&mut conn, attachment.application_id)?;
        flow::ensure_can_view(&mut conn, &application, user.user_id, user.role)?;
        attachment
    };

    let bytes = state.storage.get_object(&attachment.storage_key).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&attachment.content_type).map_err(AppError::internal)?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&inline_content_disposition(&attachment.original_name))
            .map_err(AppError::internal)?,
    );
    Ok((headers, bytes))
}

pub async fn delete_attachment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(attachment_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let key = {
        let mut conn = state.db()?;
        flow::delete_attachment(&mut conn, attachment_id, user.user_id)?
    };
    release_blobs(&state, vec![key]).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn confirm_attachments(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
) -> AppResult<Json<Application>> {
    let mut conn = state.db()?;
    Ok(Json(flow::confirm_all(&mut conn, application_id, user.user_id)?))
}

pub async fn confirm_attachment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(attachment_id): Path<Uuid>,
) -> AppResult<Json<Attachment>> {
    let mut conn = state.db()?;
    Ok(Json(flow::confirm_attachment(&mut conn, attachment_id, user.user_id)?))
}

pub async fn submit_application(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
) -> AppResult<Json<Application>> {
    let mut conn = state.db()?;
    let (application, call) =
        flow::submit_application(&mut conn, application_id, user.user_id, Utc::now().naive_utc())?;
    tracing::info!(%application_id, call_id = %call.id, "application submitted");
    notify::dispatch(
        &state.notifier,
        notify::application_submitted_email(&user.email, &call.title),
    );
    Ok(Json(application))
}

pub async fn cancel_application(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
) -> AppResult<Json<Application>> {
    let mut conn = state.db()?;
    Ok(Json(flow::cancel_application(&mut conn, application_id, user.user_id)?))
}

pub async fn assign_reviewer(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
    Query(query): Query<AssignReviewerQuery>,
) -> AppResult<(StatusCode, Json<ApplicationReviewer>)> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    let (assignment, reviewer) = flow::assign_reviewer(&mut conn, application_id, query.reviewer_id)?;
    let application = flow::get_application(&mut conn, application_id)?;
    let call = call_flow::get_call(&mut conn, application.call_id)?;

    tracing::info!(%application_id, reviewer_id = %reviewer.id, slot = assignment.slot, "assigned reviewer");
    notify::dispatch(
        &state.notifier,
        notify::reviewer_assigned_email(&reviewer.email, &state.config.public_base_url, &call.title),
    );
    Ok((StatusCode::CREATED, Json(assignment)))
}

pub async fn admin_list_for_call(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<Json<Vec<Application>>> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    Ok(Json(flow::list_for_call(&mut conn, call_id)?))
}
