use std::collections::HashSet;

use axum::http::StatusCode;
use chrono::NaiveDateTime;
use diesel::dsl::{count_star, exists};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::Role;
use crate::error::AppError;
use crate::models::{
    Application, ApplicationReviewer, Attachment, Call, DocumentDefinition, NewApplication,
    NewAttachment, User,
};
use crate::schema::{
    application_reviewers, applications, attachments, call_reviewers, calls, document_definitions,
    reviews, users,
};
use crate::upload::{parse_formats, DocumentFormat, UploadError, ALL_FORMATS};
use crate::workflow::{calls as call_rules, unique_violation};

pub const STATUS_DRAFT: &str = "draft";
pub const STATUS_SUBMITTED: &str = "submitted";
pub const STATUS_CANCELLED: &str = "cancelled";

pub const MAX_REVIEWERS: i16 = 3;

const REVIEWER_SLOT_CONSTRAINT: &str = "application_reviewers_slot_key";

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("call not found")]
    CallNotFound,
    #[error("call not available")]
    CallNotAvailable,
    #[error("already applied")]
    AlreadyApplied,
    #[error("call has reached its application limit")]
    CallFull,
    #[error("application not found")]
    NotFound,
    #[error("attachment not found")]
    AttachmentNotFound,
    #[error("document definition not found")]
    DefinitionNotFound,
    #[error("not allowed to access this application")]
    Forbidden,
    #[error("application is not a draft")]
    NotDraft,
    #[error("attachments already confirmed")]
    AlreadyConfirmed,
    #[error("no attachments to confirm")]
    NothingToConfirm,
    #[error("attachment already confirmed")]
    AttachmentConfirmed,
    #[error("missing confirmed documents: {0}")]
    MissingDocuments(String),
    #[error("reviewer not found")]
    ReviewerNotFound,
    #[error("user is not an active reviewer")]
    NotAReviewer,
    #[error("reviewer already assigned")]
    AlreadyAssigned,
    #[error("application already has 3 reviewers")]
    ReviewerCapReached,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type ApplicationResult<T> = Result<T, ApplicationError>;

impl From<ApplicationError> for AppError {
    fn from(value: ApplicationError) -> Self {
        let status = match value {
            ApplicationError::Database(err) => return AppError::from(err),
            ApplicationError::CallNotFound
            | ApplicationError::NotFound
            | ApplicationError::AttachmentNotFound
            | ApplicationError::DefinitionNotFound
            | ApplicationError::ReviewerNotFound => StatusCode::NOT_FOUND,
            ApplicationError::Forbidden => StatusCode::FORBIDDEN,
            ApplicationError::AlreadyApplied
            | ApplicationError::CallFull
            | ApplicationError::AlreadyConfirmed
            | ApplicationError::AttachmentConfirmed
            | ApplicationError::AlreadyAssigned
            | ApplicationError::ReviewerCapReached => StatusCode::CONFLICT,
            ApplicationError::Upload(UploadError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ApplicationError::CallNotAvailable
            | ApplicationError::NotDraft
            | ApplicationError::NothingToConfirm
            | ApplicationError::MissingDocuments(_)
            | ApplicationError::NotAReviewer
            | ApplicationError::Upload(_) => StatusCode::BAD_REQUEST,
        };
        AppError::new(status, value.to_string())
    }
}

/// Result of the idempotent entry point: the first write wins.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Application),
    Existing(Application),
}

impl CreateOutcome {
    pub fn created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }

    pub fn into_inner(self) -> Application {
        match self {
            CreateOutcome::Created(app) | CreateOutcome::Existing(app) => app,
        }
    }
}

pub fn find_for_user(
    conn: &mut PgConnection,
    user_id: Uuid,
    call_id: Uuid,
) -> ApplicationResult<Option<Application>> {
    Ok(applications::table
        .filter(applications::user_id.eq(user_id))
        .filter(applications::call_id.eq(call_id))
        .first(conn)
        .optional()?)
}

/// Strict create: a second application to the same call is an error.
pub fn create_application(
    conn: &mut PgConnection,
    user_id: Uuid,
    call_id: Uuid,
    content: String,
    now: NaiveDateTime,
) -> ApplicationResult<Application> {
    conn.transaction(|conn| {
        // The call row lock serialises the max_applications count.
        let call: Call = calls::table
            .find(call_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(ApplicationError::CallNotFound)?;

        if !call_rules::accepts_applications(&call, now) {
            return Err(ApplicationError::CallNotAvailable);
        }
        if find_for_user(conn, user_id, call_id)?.is_some() {
            return Err(ApplicationError::AlreadyApplied);
        }
        if let Some(max) = call.max_applications {
            let current: i64 = applications::table
                .filter(applications::call_id.eq(call_id))
                .filter(applications::status.ne(STATUS_CANCELLED))
                .select(count_star())
                .first(conn)?;
            if current >= i64::from(max) {
                return Err(ApplicationError::CallFull);
            }
        }

        let row = NewApplication {
            id: Uuid::new_v4(),
            user_id,
            call_id,
            content,
            status: STATUS_DRAFT.to_string(),
        };
        insert_application(conn, &row)
    })
}

/// The unique `(user_id, call_id)` index decides between concurrent creates.
pub fn insert_application(
    conn: &mut PgConnection,
    row: &NewApplication,
) -> ApplicationResult<Application> {
    match diesel::insert_into(applications::table)
        .values(row)
        .get_result(conn)
    {
        Ok(app) => Ok(app),
        Err(err) if unique_violation(&err).is_some() => Err(ApplicationError::AlreadyApplied),
        Err(err) => Err(err.into()),
    }
}

pub fn get_or_create_application(
    conn: &mut PgConnection,
    user_id: Uuid,
    call_id: Uuid,
    now: NaiveDateTime,
) -> ApplicationResult<CreateOutcome> {
    if let Some(existing) = find_for_user(conn, user_id, call_id)? {
        return Ok(CreateOutcome::Existing(existing));
    }
    match create_application(conn, user_id, call_id, String::new(), now) {
        Ok(app) => Ok(CreateOutcome::Created(app)),
        // Lost a race with a concurrent create for the same pair.
        Err(ApplicationError::AlreadyApplied) => find_for_user(conn, user_id, call_id)?
            .map(CreateOutcome::Existing)
            .ok_or(ApplicationError::AlreadyApplied),
        Err(err) => Err(err),
    }
}

pub fn get_application(conn: &mut PgConnection, application_id: Uuid) -> ApplicationResult<Application> {
    applications::table
        .find(application_id)
        .first(conn)
        .optional()?
        .ok_or(ApplicationError::NotFound)
}

fn lock_owned(
    conn: &mut PgConnection,
    application_id: Uuid,
    user_id: Uuid,
) -> ApplicationResult<Application> {
    let app: Application = applications::table
        .find(application_id)
        .for_update()
        .first(conn)
        .optional()?
        .ok_or(ApplicationError::NotFound)?;
    if app.user_id != user_id {
        return Err(ApplicationError::Forbidden);
    }
    Ok(app)
}

fn lock_owned_draft(
    conn: &mut PgConnection,
    application_id: Uuid,
    user_id: Uuid,
) -> ApplicationResult<Application> {
    let app = lock_owned(conn, application_id, user_id)?;
    if app.status != STATUS_DRAFT {
        return Err(ApplicationError::NotDraft);
    }
    Ok(app)
}

pub fn is_assigned_reviewer(
    conn: &mut PgConnection,
    application: &Application,
    reviewer_id: Uuid,
) -> ApplicationResult<bool> {
    let assigned = diesel::select(exists(
        application_reviewers::table
            .filter(application_reviewers::application_id.eq(application.id))
            .filter(application_reviewers::user_id.eq(reviewer_id)),
    ))
    .get_result::<bool>(conn)?;
    if assigned {
        return Ok(true);
    }
    Ok(diesel::select(exists(
        call_reviewers::table
            .filter(call_reviewers::call_id.eq(application.call_id))
            .filter(call_reviewers::reviewer_id.eq(reviewer_id)),
    ))
    .get_result::<bool>(conn)?)
}

/// Owners, admins and reviewers of the application (directly or via its call).
pub fn ensure_can_view(
    conn: &mut PgConnection,
    application: &Application,
    user_id: Uuid,
    role: Role,
) -> ApplicationResult<()> {
    let allowed = match role {
        Role::Admin => true,
        Role::Reviewer => {
            application.user_id == user_id || is_assigned_reviewer(conn, application, user_id)?
        }
        Role::Applicant => application.user_id == user_id,
    };
    if allowed {
        Ok(())
    } else {
        Err(ApplicationError::Forbidden)
    }
}

pub fn list_for_user(conn: &mut PgConnection, user_id: Uuid) -> ApplicationResult<Vec<Application>> {
    Ok(applications::table
        .filter(applications::user_id.eq(user_id))
        .order(applications::created_at.desc())
        .load(conn)?)
}

pub fn list_for_call(conn: &mut PgConnection, call_id: Uuid) -> ApplicationResult<Vec<Application>> {
    calls::table
        .find(call_id)
        .select(calls::id)
        .first::<Uuid>(conn)
        .optional()?
        .ok_or(ApplicationError::CallNotFound)?;
    Ok(applications::table
        .filter(applications::call_id.eq(call_id))
        .order(applications::created_at.asc())
        .load(conn)?)
}

pub fn list_assigned(conn: &mut PgConnection, reviewer_id: Uuid) -> ApplicationResult<Vec<Application>> {
    Ok(applications::table
        .inner_join(application_reviewers::table)
        .filter(application_reviewers::user_id.eq(reviewer_id))
        .select(applications::all_columns)
        .order(applications::created_at.asc())
        .load(conn)?)
}

pub fn attachments_for(
    conn: &mut PgConnection,
    application_id: Uuid,
) -> ApplicationResult<Vec<Attachment>> {
    Ok(attachments::table
        .filter(attachments::application_id.eq(application_id))
        .order(attachments::uploaded_at.asc())
        .load(conn)?)
}

pub fn reviewers_for(conn: &mut PgConnection, application_id: Uuid) -> ApplicationResult<Vec<Uuid>> {
    Ok(application_reviewers::table
        .filter(application_reviewers::application_id.eq(application_id))
        .order(application_reviewers::slot.asc())
        .select(application_reviewers::user_id)
        .load(conn)?)
}

pub fn get_attachment(conn: &mut PgConnection, attachment_id: Uuid) -> ApplicationResult<Attachment> {
    attachments::table
        .find(attachment_id)
        .first(conn)
        .optional()?
        .ok_or(ApplicationError::AttachmentNotFound)
}

/// Whether any attachment row still points at the blob under `storage_key`.
pub fn blob_referenced(conn: &mut PgConnection, storage_key: &str) -> QueryResult<bool> {
    diesel::select(exists(
        attachments::table.filter(attachments::storage_key.eq(storage_key)),
    ))
    .get_result(conn)
}

/// Where an upload is headed and which formats it may use.
#[derive(Debug)]
pub struct UploadTarget {
    pub application: Application,
    pub definition: Option<DocumentDefinition>,
    pub allowed: Vec<DocumentFormat>,
}

pub fn prepare_upload(
    conn: &mut PgConnection,
    application_id: Uuid,
    user_id: Uuid,
    document_id: Option<Uuid>,
) -> ApplicationResult<UploadTarget> {
    let application = get_application(conn, application_id)?;
    if application.user_id != user_id {
        return Err(ApplicationError::Forbidden);
    }
    check_accepts_uploads(&application)?;

    let definition = match document_id {
        Some(id) => Some(
            document_definitions::table
                .filter(document_definitions::id.eq(id))
                .filter(document_definitions::call_id.eq(application.call_id))
                .first::<DocumentDefinition>(conn)
                .optional()?
                .ok_or(ApplicationError::DefinitionNotFound)?,
        ),
        None => None,
    };
    let allowed = match &definition {
        Some(def) => parse_formats(&def.allowed_formats)?,
        None => ALL_FORMATS.to_vec(),
    };

    Ok(UploadTarget {
        application,
        definition,
        allowed,
    })
}

fn check_accepts_uploads(application: &Application) -> ApplicationResult<()> {
    if application.status != STATUS_DRAFT {
        return Err(ApplicationError::NotDraft);
    }
    if application.documents_confirmed {
        return Err(ApplicationError::AlreadyConfirmed);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub storage_key: String,
}

/// Records already-stored blobs as attachments. The upload gate is checked
/// again under the application row lock.
pub fn record_attachments(
    conn: &mut PgConnection,
    application_id: Uuid,
    user_id: Uuid,
    document_id: Option<Uuid>,
    files: Vec<StoredFile>,
) -> ApplicationResult<Vec<Attachment>> {
    conn.transaction(|conn| {
        let application = lock_owned(conn, application_id, user_id)?;
        check_accepts_uploads(&application)?;

        let rows: Vec<NewAttachment> = files
            .into_iter()
            .map(|file| NewAttachment {
                id: Uuid::new_v4(),
                application_id,
                document_id,
                original_name: file.original_name,
                content_type: file.content_type,
                size_bytes: file.size_bytes,
                checksum: file.checksum,
                storage_key: file.storage_key,
            })
            .collect();
        Ok(diesel::insert_into(attachments::table)
            .values(&rows)
            .get_results(conn)?)
    })
}

/// Bulk confirmation: one-way, needs at least one attachment and none
/// confirmed individually beforehand.
pub fn confirm_all(
    conn: &mut PgConnection,
    application_id: Uuid,
    user_id: Uuid,
) -> ApplicationResult<Application> {
    conn.transaction(|conn| {
        let application = lock_owned_draft(conn, application_id, user_id)?;
        if application.documents_confirmed {
            return Err(ApplicationError::AlreadyConfirmed);
        }

        let files = attachments_for(conn, application_id)?;
        if files.is_empty() {
            return Err(ApplicationError::NothingToConfirm);
        }
        if files.iter().any(|file| file.is_confirmed) {
            return Err(ApplicationError::AlreadyConfirmed);
        }

        diesel::update(attachments::table.filter(attachments::application_id.eq(application_id)))
            .set(attachments::is_confirmed.eq(true))
            .execute(conn)?;
        Ok(diesel::update(applications::table.find(application_id))
            .set((
                applications::documents_confirmed.eq(true),
                applications::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .get_result(conn)?)
    })
}

pub fn confirm_attachment(
    conn: &mut PgConnection,
    attachment_id: Uuid,
    user_id: Uuid,
) -> ApplicationResult<Attachment> {
    conn.transaction(|conn| {
        let application_id = get_attachment(conn, attachment_id)?.application_id;
        lock_owned_draft(conn, application_id, user_id)?;
        let attachment = lock_attachment(conn, attachment_id)?;
        if attachment.is_confirmed {
            return Err(ApplicationError::AttachmentConfirmed);
        }
        Ok(diesel::update(attachments::table.find(attachment_id))
            .set(attachments::is_confirmed.eq(true))
            .get_result(conn)?)
    })
}

/// Re-reads the attachment once its application is locked, so a confirmation
/// that committed in between is seen.
fn lock_attachment(conn: &mut PgConnection, attachment_id: Uuid) -> ApplicationResult<Attachment> {
    attachments::table
        .find(attachment_id)
        .for_update()
        .first(conn)
        .optional()?
        .ok_or(ApplicationError::AttachmentNotFound)
}

/// Returns the storage key of the removed attachment.
pub fn delete_attachment(
    conn: &mut PgConnection,
    attachment_id: Uuid,
    user_id: Uuid,
) -> ApplicationResult<String> {
    conn.transaction(|conn| {
        let application_id = get_attachment(conn, attachment_id)?.application_id;
        let application = lock_owned_draft(conn, application_id, user_id)?;
        let attachment = lock_attachment(conn, attachment_id)?;
        if application.documents_confirmed {
            return Err(ApplicationError::AlreadyConfirmed);
        }
        if attachment.is_confirmed {
            return Err(ApplicationError::AttachmentConfirmed);
        }
        diesel::delete(attachments::table.find(attachment_id)).execute(conn)?;
        Ok(attachment.storage_key)
    })
}

/// Names of the call's document definitions lacking a confirmed attachment.
pub fn missing_documents(
    definitions: &[DocumentDefinition],
    files: &[Attachment],
) -> Vec<String> {
    let covered: HashSet<Uuid> = files
        .iter()
        .filter(|file| file.is_confirmed)
        .filter_map(|file| file.document_id)
        .collect();
    definitions
        .iter()
        .filter(|def| !covered.contains(&def.id))
        .map(|def| def.name.clone())
        .collect()
}

pub fn submit_application(
    conn: &mut PgConnection,
    application_id: Uuid,
    user_id: Uuid,
    now: NaiveDateTime,
) -> ApplicationResult<(Application, Call)> {
    conn.transaction(|conn| {
        let application = lock_owned_draft(conn, application_id, user_id)?;
        let call: Call = calls::table.find(application.call_id).first(conn)?;
        if !call_rules::accepts_applications(&call, now) {
            return Err(ApplicationError::CallNotAvailable);
        }

        let definitions: Vec<DocumentDefinition> = document_definitions::table
            .filter(document_definitions::call_id.eq(call.id))
            .order(document_definitions::created_at.asc())
            .load(conn)?;
        let files = attachments_for(conn, application_id)?;
        let missing = missing_documents(&definitions, &files);
        if !missing.is_empty() {
            return Err(ApplicationError::MissingDocuments(missing.join(", ")));
        }

        let submitted: Application = diesel::update(applications::table.find(application_id))
            .set((
                applications::status.eq(STATUS_SUBMITTED),
                applications::submitted_at.eq(Some(now)),
                applications::updated_at.eq(now),
            ))
            .get_result(conn)?;
        Ok((submitted, call))
    })
}

pub fn cancel_application(
    conn: &mut PgConnection,
    application_id: Uuid,
    user_id: Uuid,
) -> ApplicationResult<Application> {
    conn.transaction(|conn| {
        lock_owned_draft(conn, application_id, user_id)?;
        Ok(diesel::update(applications::table.find(application_id))
            .set((
                applications::status.eq(STATUS_CANCELLED),
                applications::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .get_result(conn)?)
    })
}

/// Only drafts can be deleted, by their owner or an admin. Returns the
/// storage keys of removed attachments.
pub fn delete_application(
    conn: &mut PgConnection,
    application_id: Uuid,
    user_id: Uuid,
    role: Role,
) -> ApplicationResult<Vec<String>> {
    conn.transaction(|conn| {
        let application: Application = applications::table
            .find(application_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(ApplicationError::NotFound)?;
        if application.user_id != user_id && role != Role::Admin {
            return Err(ApplicationError::Forbidden);
        }
        if application.status != STATUS_DRAFT {
            return Err(ApplicationError::NotDraft);
        }
        Ok(delete_applications_ordered(conn, &[application_id])?)
    })
}

/// Removes applications children first: attachments, reviews, reviewer
/// assignments, then the rows themselves. Must run inside a transaction.
pub(crate) fn delete_applications_ordered(
    conn: &mut PgConnection,
    application_ids: &[Uuid],
) -> QueryResult<Vec<String>> {
    if application_ids.is_empty() {
        return Ok(Vec::new());
    }
    let keys: Vec<String> = diesel::delete(
        attachments::table.filter(attachments::application_id.eq_any(application_ids)),
    )
    .returning(attachments::storage_key)
    .get_results(conn)?;
    diesel::delete(reviews::table.filter(reviews::application_id.eq_any(application_ids)))
        .execute(conn)?;
    diesel::delete(
        application_reviewers::table
            .filter(application_reviewers::application_id.eq_any(application_ids)),
    )
    .execute(conn)?;
    diesel::delete(applications::table.filter(applications::id.eq_any(application_ids)))
        .execute(conn)?;
    Ok(keys)
}

/// Lowest free reviewer slot, if any remain.
pub fn next_slot(taken: &[i16]) -> Option<i16> {
    (1..=MAX_REVIEWERS).find(|slot| !taken.contains(slot))
}

/// Append-only: duplicates and a fourth reviewer are rejected. The unique
/// `(application_id, slot)` constraint caps assignments at the storage level.
pub fn assign_reviewer(
    conn: &mut PgConnection,
    application_id: Uuid,
    reviewer_id: Uuid,
) -> ApplicationResult<(ApplicationReviewer, User)> {
    conn.transaction(|conn| {
        applications::table
            .find(application_id)
            .for_update()
            .first::<Application>(conn)
            .optional()?
            .ok_or(ApplicationError::NotFound)?;

        let reviewer: User = users::table
            .find(reviewer_id)
            .first(conn)
            .optional()?
            .ok_or(ApplicationError::ReviewerNotFound)?;
        if Role::parse(&reviewer.role) != Some(Role::Reviewer) || !reviewer.is_active {
            return Err(ApplicationError::NotAReviewer);
        }

        let current: Vec<ApplicationReviewer> = application_reviewers::table
            .filter(application_reviewers::application_id.eq(application_id))
            .load(conn)?;
        if current.iter().any(|row| row.user_id == reviewer_id) {
            return Err(ApplicationError::AlreadyAssigned);
        }
        let taken: Vec<i16> = current.iter().map(|row| row.slot).collect();
        let slot = next_slot(&taken).ok_or(ApplicationError::ReviewerCapReached)?;

        let row = ApplicationReviewer {
            application_id,
            user_id: reviewer_id,
            slot,
            assigned_at: chrono::Utc::now().naive_utc(),
        };
        let saved = insert_assignment(conn, &row)?;
        Ok((saved, reviewer))
    })
}

/// Storage-level arbiter for assignments: a taken slot means the cap was
/// reached concurrently, the primary key means a duplicate reviewer.
pub fn insert_assignment(
    conn: &mut PgConnection,
    row: &ApplicationReviewer,
) -> ApplicationResult<ApplicationReviewer> {
    match diesel::insert_into(application_reviewers::table)
        .values(row)
        .get_result(conn)
    {
        Ok(saved) => Ok(saved),
        Err(err) => match unique_violation(&err) {
            Some(REVIEWER_SLOT_CONSTRAINT) => Err(ApplicationError::ReviewerCapReached),
            Some(_) => Err(ApplicationError::AlreadyAssigned),
            None => Err(err.into()),
        },
    }
}
