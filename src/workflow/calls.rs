use std::collections::HashMap;

use chrono::NaiveDateTime;
use diesel::dsl::count_star;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use uuid::Uuid;

use crate::error::AppError;
use crate::export::ExportRow;
use crate::models::{Application, Call, DocumentDefinition, NewCall, NewDocumentDefinition};
use crate::schema::{attachments, call_reviewers, calls, document_definitions, reviewer_invites};
use crate::upload::{formats_to_string, parse_formats};
use crate::workflow::applications;

pub const STATUS_DRAFT: &str = "DRAFT";
pub const STATUS_PUBLISHED: &str = "PUBLISHED";
pub const STATUS_CLOSED: &str = "CLOSED";
pub const STATUS_ARCHIVED: &str = "ARCHIVED";

pub const CALL_STATUSES: [&str; 4] = [STATUS_DRAFT, STATUS_PUBLISHED, STATUS_CLOSED, STATUS_ARCHIVED];

#[derive(Debug, Error)]
pub enum CallError {
    #[error("{0}")]
    Invalid(String),
    #[error("call not found")]
    NotFound,
    #[error("document definition not found")]
    DefinitionNotFound,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type CallResult<T> = Result<T, CallError>;

impl From<CallError> for AppError {
    fn from(value: CallError) -> Self {
        match value {
            CallError::Invalid(message) => AppError::bad_request(message),
            CallError::NotFound | CallError::DefinitionNotFound => {
                AppError::new(axum::http::StatusCode::NOT_FOUND, value.to_string())
            }
            CallError::Database(err) => AppError::from(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallInput {
    pub title: String,
    pub description: Option<String>,
    pub is_open: bool,
    pub status: String,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub category: Option<String>,
    pub max_applications: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct DefinitionInput {
    pub name: String,
    pub description: Option<String>,
    pub allowed_formats: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Create,
    Update,
}

/// Returns the input with title/category trimmed and status upper-cased.
pub fn validate_call(input: CallInput, mode: CallMode) -> CallResult<CallInput> {
    let title = input.title.trim().to_string();
    let title_len = title.chars().count();
    if !(3..=200).contains(&title_len) {
        return Err(CallError::Invalid(
            "title must be between 3 and 200 characters".into(),
        ));
    }

    let category = input
        .category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    if category.as_ref().is_some_and(|c| c.chars().count() > 50) {
        return Err(CallError::Invalid(
            "category must be at most 50 characters".into(),
        ));
    }

    if input.max_applications.is_some_and(|max| max <= 0) {
        return Err(CallError::Invalid(
            "max_applications must be greater than zero".into(),
        ));
    }

    if let (Some(start), Some(end)) = (input.start_date, input.end_date) {
        if end <= start {
            return Err(CallError::Invalid(
                "end_date must be after start_date".into(),
            ));
        }
    }

    let status = input.status.trim().to_ascii_uppercase();
    let permitted: &[&str] = match mode {
        CallMode::Create => &[STATUS_DRAFT, STATUS_PUBLISHED],
        CallMode::Update => &CALL_STATUSES,
    };
    if !permitted.contains(&status.as_str()) {
        return Err(CallError::Invalid(format!(
            "status must be one of {}",
            permitted.join(", ")
        )));
    }

    Ok(CallInput {
        title,
        category,
        status,
        ..input
    })
}

pub fn validate_definition(input: DefinitionInput) -> CallResult<DefinitionInput> {
    let name = input.name.trim().to_string();
    if name.is_empty() || name.chars().count() > 200 {
        return Err(CallError::Invalid(
            "document name must be between 1 and 200 characters".into(),
        ));
    }
    let formats =
        parse_formats(&input.allowed_formats).map_err(|err| CallError::Invalid(err.to_string()))?;
    Ok(DefinitionInput {
        name,
        allowed_formats: formats_to_string(&formats),
        ..input
    })
}

/// Published and inside the date window; open bounds are unbounded.
pub fn is_active(call: &Call, now: NaiveDateTime) -> bool {
    call.status == STATUS_PUBLISHED
        && call.start_date.map_or(true, |start| start <= now)
        && call.end_date.map_or(true, |end| now <= end)
}

pub fn accepts_applications(call: &Call, now: NaiveDateTime) -> bool {
    call.is_open && is_active(call, now)
}

pub fn get_call(conn: &mut PgConnection, call_id: Uuid) -> CallResult<Call> {
    calls::table
        .find(call_id)
        .first(conn)
        .optional()?
        .ok_or(CallError::NotFound)
}

pub fn is_call_reviewer(conn: &mut PgConnection, call_id: Uuid, reviewer_id: Uuid) -> CallResult<bool> {
    get_call(conn, call_id)?;
    Ok(diesel::select(diesel::dsl::exists(
        call_reviewers::table
            .filter(call_reviewers::call_id.eq(call_id))
            .filter(call_reviewers::reviewer_id.eq(reviewer_id)),
    ))
    .get_result::<bool>(conn)?)
}

pub fn list_calls(
    conn: &mut PgConnection,
    only_open: bool,
    skip: i64,
    limit: i64,
    now: NaiveDateTime,
) -> CallResult<Vec<Call>> {
    let mut query = calls::table.into_boxed();
    if only_open {
        query = query
            .filter(calls::status.eq(STATUS_PUBLISHED))
            .filter(calls::is_open.eq(true))
            .filter(calls::start_date.is_null().or(calls::start_date.le(now)))
            .filter(calls::end_date.is_null().or(calls::end_date.ge(now)));
    }
    Ok(query
        .order(calls::created_at.desc())
        .offset(skip.max(0))
        .limit(limit.clamp(1, 500))
        .load(conn)?)
}

/// The call and its definitions are committed together or not at all.
pub fn create_call(
    conn: &mut PgConnection,
    input: CallInput,
    definitions: Vec<DefinitionInput>,
) -> CallResult<(Call, Vec<DocumentDefinition>)> {
    let input = validate_call(input, CallMode::Create)?;
    let definitions = definitions
        .into_iter()
        .map(validate_definition)
        .collect::<CallResult<Vec<_>>>()?;

    conn.transaction(|conn| {
        let new_call = NewCall {
            id: Uuid::new_v4(),
            title: input.title,
            description: input.description,
            is_open: input.is_open,
            status: input.status,
            start_date: input.start_date,
            end_date: input.end_date,
            category: input.category,
            max_applications: input.max_applications,
        };
        let call: Call = diesel::insert_into(calls::table)
            .values(&new_call)
            .get_result(conn)?;

        let rows: Vec<NewDocumentDefinition> = definitions
            .into_iter()
            .map(|def| NewDocumentDefinition {
                id: Uuid::new_v4(),
                call_id: call.id,
                name: def.name,
                description: def.description,
                allowed_formats: def.allowed_formats,
            })
            .collect();
        let saved: Vec<DocumentDefinition> = if rows.is_empty() {
            Vec::new()
        } else {
            diesel::insert_into(document_definitions::table)
                .values(&rows)
                .get_results(conn)?
        };

        Ok((call, saved))
    })
}

pub fn update_call(conn: &mut PgConnection, call_id: Uuid, input: CallInput) -> CallResult<Call> {
    let input = validate_call(input, CallMode::Update)?;
    let updated = diesel::update(calls::table.find(call_id))
        .set((
            calls::title.eq(input.title),
            calls::description.eq(input.description),
            calls::is_open.eq(input.is_open),
            calls::status.eq(input.status),
            calls::start_date.eq(input.start_date),
            calls::end_date.eq(input.end_date),
            calls::category.eq(input.category),
            calls::max_applications.eq(input.max_applications),
            calls::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .get_result(conn)
        .optional()?;
    updated.ok_or(CallError::NotFound)
}

/// Deletes the call and everything hanging off it, children first. Returns
/// the storage keys of removed attachments.
pub fn delete_call(conn: &mut PgConnection, call_id: Uuid) -> CallResult<Vec<String>> {
    conn.transaction(|conn| {
        calls::table
            .find(call_id)
            .for_update()
            .first::<Call>(conn)
            .optional()?
            .ok_or(CallError::NotFound)?;

        let application_ids: Vec<Uuid> = crate::schema::applications::table
            .filter(crate::schema::applications::call_id.eq(call_id))
            .select(crate::schema::applications::id)
            .load(conn)?;
        let keys = applications::delete_applications_ordered(conn, &application_ids)?;

        diesel::delete(reviewer_invites::table.filter(reviewer_invites::call_id.eq(call_id)))
            .execute(conn)?;
        diesel::delete(call_reviewers::table.filter(call_reviewers::call_id.eq(call_id)))
            .execute(conn)?;
        diesel::delete(
            document_definitions::table.filter(document_definitions::call_id.eq(call_id)),
        )
        .execute(conn)?;
        diesel::delete(calls::table.find(call_id)).execute(conn)?;

        Ok(keys)
    })
}

pub fn list_definitions(
    conn: &mut PgConnection,
    call_id: Uuid,
) -> CallResult<Vec<DocumentDefinition>> {
    get_call(conn, call_id)?;
    Ok(document_definitions::table
        .filter(document_definitions::call_id.eq(call_id))
        .order(document_definitions::created_at.asc())
        .load(conn)?)
}

pub fn add_definition(
    conn: &mut PgConnection,
    call_id: Uuid,
    input: DefinitionInput,
) -> CallResult<DocumentDefinition> {
    let input = validate_definition(input)?;
    get_call(conn, call_id)?;
    let row = NewDocumentDefinition {
        id: Uuid::new_v4(),
        call_id,
        name: input.name,
        description: input.description,
        allowed_formats: input.allowed_formats,
    };
    Ok(diesel::insert_into(document_definitions::table)
        .values(&row)
        .get_result(conn)?)
}

pub fn update_definition(
    conn: &mut PgConnection,
    call_id: Uuid,
    definition_id: Uuid,
    input: DefinitionInput,
) -> CallResult<DocumentDefinition> {
    let input = validate_definition(input)?;
    get_call(conn, call_id)?;
    let updated = diesel::update(
        document_definitions::table
            .filter(document_definitions::id.eq(definition_id))
            .filter(document_definitions::call_id.eq(call_id)),
    )
    .set((
        document_definitions::name.eq(input.name),
        document_definitions::description.eq(input.description),
        document_definitions::allowed_formats.eq(input.allowed_formats),
    ))
    .get_result(conn)
    .optional()?;
    updated.ok_or(CallError::DefinitionNotFound)
}

/// Attachments filed under the definition are kept but detached from it.
pub fn delete_definition(
    conn: &mut PgConnection,
    call_id: Uuid,
    definition_id: Uuid,
) -> CallResult<()> {
    get_call(conn, call_id)?;
    conn.transaction(|conn| {
        let definition = document_definitions::table
            .filter(document_definitions::id.eq(definition_id))
            .filter(document_definitions::call_id.eq(call_id))
            .first::<DocumentDefinition>(conn)
            .optional()?
            .ok_or(CallError::DefinitionNotFound)?;

        diesel::update(attachments::table.filter(attachments::document_id.eq(definition.id)))
            .set(attachments::document_id.eq(None::<Uuid>))
            .execute(conn)?;
        diesel::delete(document_definitions::table.find(definition.id)).execute(conn)?;
        Ok(())
    })
}

/// One export row per application of the call, oldest first.
pub fn export_rows(conn: &mut PgConnection, call_id: Uuid) -> CallResult<(Call, Vec<ExportRow>)> {
    use crate::schema::{applications as apps, reviews, users};

    let call = get_call(conn, call_id)?;
    let entries: Vec<(Application, String)> = apps::table
        .inner_join(users::table)
        .filter(apps::call_id.eq(call_id))
        .order(apps::created_at.asc())
        .select((apps::all_columns, users::email))
        .load(conn)?;
    let ids: Vec<Uuid> = entries.iter().map(|(app, _)| app.id).collect();

    let attachment_counts: HashMap<Uuid, i64> = attachments::table
        .filter(attachments::application_id.eq_any(&ids))
        .group_by(attachments::application_id)
        .select((attachments::application_id, count_star()))
        .load::<(Uuid, i64)>(conn)?
        .into_iter()
        .collect();

    let mut scores: HashMap<Uuid, Vec<i32>> = HashMap::new();
    for (application_id, score) in reviews::table
        .filter(reviews::application_id.eq_any(&ids))
        .select((reviews::application_id, reviews::score))
        .load::<(Uuid, i32)>(conn)?
    {
        scores.entry(application_id).or_default().push(score);
    }

    let rows = entries
        .into_iter()
        .map(|(app, email)| {
            let app_scores = scores.remove(&app.id).unwrap_or_default();
            let average_score = (!app_scores.is_empty()).then(|| {
                app_scores.iter().map(|s| f64::from(*s)).sum::<f64>() / app_scores.len() as f64
            });
            ExportRow {
                applicant: email,
                status: app.status,
                submitted_at: app
                    .submitted_at
                    .map(|at| at.format("%Y-%m-%d %H:%M").to_string()),
                attachment_count: attachment_counts.get(&app.id).copied().unwrap_or(0),
                review_count: app_scores.len() as i64,
                average_score,
            }
        })
        .collect();
    Ok((call, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn call(status: &str, start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Call {
        Call {
            id: Uuid::new_v4(),
            title: "Seed grants".into(),
            description: None,
            is_open: true,
            status: status.into(),
            start_date: start,
            end_date: end,
            category: None,
            max_applications: None,
            created_at: at(1),
            updated_at: at(1),
        }
    }

    fn input() -> CallInput {
        CallInput {
            title: "  Seed grants ".into(),
            description: None,
            is_open: true,
            status: "published".into(),
            start_date: Some(at(1)),
            end_date: Some(at(20)),
            category: Some(" research ".into()),
            max_applications: Some(10),
        }
    }

    #[test]
    fn activity_requires_published_and_window() {
        let now = at(10);
        assert!(is_active(&call(STATUS_PUBLISHED, Some(at(1)), Some(at(20))), now));
        assert!(is_active(&call(STATUS_PUBLISHED, None, None), now));
        assert!(!is_active(&call(STATUS_DRAFT, None, None), now));
        assert!(!is_active(&call(STATUS_CLOSED, None, None), now));
        assert!(!is_active(&call(STATUS_PUBLISHED, Some(at(11)), None), now));
        assert!(!is_active(&call(STATUS_PUBLISHED, None, Some(at(9))), now));
        assert!(is_active(&call(STATUS_PUBLISHED, Some(now), Some(now + Duration::seconds(1))), now));
    }

    #[test]
    fn closed_flag_blocks_new_applications() {
        let mut published = call(STATUS_PUBLISHED, None, None);
        assert!(accepts_applications(&published, at(10)));
        published.is_open = false;
        assert!(!accepts_applications(&published, at(10)));
    }

    #[test]
    fn validation_normalises_input() {
        let valid = validate_call(input(), CallMode::Create).unwrap();
        assert_eq!(valid.title, "Seed grants");
        assert_eq!(valid.status, STATUS_PUBLISHED);
        assert_eq!(valid.category.as_deref(), Some("research"));
    }

    #[test]
    fn validation_rejects_bad_calls() {
        let cases = [
            CallInput { title: "ab".into(), ..input() },
            CallInput { title: "x".repeat(201), ..input() },
            CallInput { category: Some("c".repeat(51)), ..input() },
            CallInput { max_applications: Some(0), ..input() },
            CallInput { end_date: Some(at(1)), ..input() },
            CallInput { status: "CLOSED".into(), ..input() },
            CallInput { status: "pending".into(), ..input() },
        ];
        for case in cases {
            assert!(matches!(
                validate_call(case, CallMode::Create),
                Err(CallError::Invalid(_))
            ));
        }
        assert!(validate_call(CallInput { status: "ARCHIVED".into(), ..input() }, CallMode::Update).is_ok());
    }

    #[test]
    fn definition_formats_are_canonicalised() {
        let def = validate_definition(DefinitionInput {
            name: " CV ".into(),
            description: None,
            allowed_formats: "text,pdf".into(),
        })
        .unwrap();
        assert_eq!(def.name, "CV");
        assert_eq!(def.allowed_formats, "pdf,text");

        assert!(validate_definition(DefinitionInput {
            name: "CV".into(),
            description: None,
            allowed_formats: "docx".into(),
        })
        .is_err());
    }
}
