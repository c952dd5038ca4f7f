use axum::http::StatusCode;
use chrono::{Duration, NaiveDateTime};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use rand::{rngs::OsRng, Rng};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::Role;
use crate::error::AppError;
use crate::models::{Call, CallReviewer, NewReviewerInvite, ReviewerInvite, User};
use crate::schema::{call_reviewers, calls, reviewer_invites, users};
use crate::workflow::accounts::normalize_email;
use crate::workflow::unique_violation;

pub const TOKEN_LENGTH: usize = 12;
pub const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const MIN_EXPIRATION_HOURS: i64 = 1;
pub const MAX_EXPIRATION_HOURS: i64 = 720;

const TOKEN_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum InviteError {
    #[error("call not found")]
    CallNotFound,
    #[error("invite not found")]
    NotFound,
    #[error("invite already used")]
    AlreadyUsed,
    #[error("invite expired")]
    Expired,
    #[error("only reviewers can accept invites")]
    NotAReviewer,
    #[error("invite was issued for a different email")]
    EmailMismatch,
    #[error("expiration_hours must be between 1 and 720")]
    InvalidExpiration,
    #[error("{0}")]
    Invalid(String),
    #[error("could not allocate a unique invite token")]
    TokenExhausted,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type InviteResult<T> = Result<T, InviteError>;

impl From<InviteError> for AppError {
    fn from(value: InviteError) -> Self {
        let status = match value {
            InviteError::Database(err) => return AppError::from(err),
            InviteError::TokenExhausted => return AppError::internal(value),
            InviteError::CallNotFound | InviteError::NotFound => StatusCode::NOT_FOUND,
            InviteError::AlreadyUsed => StatusCode::CONFLICT,
            InviteError::NotAReviewer | InviteError::EmailMismatch => StatusCode::FORBIDDEN,
            InviteError::Expired | InviteError::InvalidExpiration | InviteError::Invalid(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        AppError::new(status, value.to_string())
    }
}

pub fn generate_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..TOKEN_LENGTH)
        .map(|_| char::from(TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())]))
        .collect()
}

pub fn validate_expiration(hours: i64) -> InviteResult<Duration> {
    if !(MIN_EXPIRATION_HOURS..=MAX_EXPIRATION_HOURS).contains(&hours) {
        return Err(InviteError::InvalidExpiration);
    }
    Ok(Duration::hours(hours))
}

/// Issues an invite for `email` on `call_id`. A token collision retries with
/// a fresh token; the unique index on `token` is the arbiter.
pub fn create_invite(
    conn: &mut PgConnection,
    call_id: Uuid,
    email: &str,
    expiration_hours: i64,
    created_by: Uuid,
    now: NaiveDateTime,
) -> InviteResult<(ReviewerInvite, Call)> {
    let valid_for = validate_expiration(expiration_hours)?;
    let email = normalize_email(email).map_err(|err| InviteError::Invalid(err.to_string()))?;
    let call: Call = calls::table
        .find(call_id)
        .first(conn)
        .optional()?
        .ok_or(InviteError::CallNotFound)?;

    for attempt in 1..=TOKEN_ATTEMPTS {
        let row = NewReviewerInvite {
            id: Uuid::new_v4(),
            call_id,
            email: email.clone(),
            token: generate_token(&mut OsRng),
            expires_at: now + valid_for,
            created_by: Some(created_by),
        };
        match diesel::insert_into(reviewer_invites::table)
            .values(&row)
            .get_result::<ReviewerInvite>(conn)
        {
            Ok(invite) => return Ok((invite, call)),
            Err(err) if unique_violation(&err).is_some() => {
                tracing::warn!(attempt, "invite token collision, regenerating");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(InviteError::TokenExhausted)
}

pub fn list_invites(
    conn: &mut PgConnection,
    call_id: Option<Uuid>,
) -> InviteResult<Vec<ReviewerInvite>> {
    let mut query = reviewer_invites::table
        .order(reviewer_invites::created_at.desc())
        .into_boxed();
    if let Some(call_id) = call_id {
        query = query.filter(reviewer_invites::call_id.eq(call_id));
    }
    Ok(query.load(conn)?)
}

/// Consumes the invite and links the reviewer to its call in one
/// transaction; the invite row lock makes a token single-use under
/// concurrent accepts.
pub fn accept_invite(
    conn: &mut PgConnection,
    token: &str,
    user_id: Uuid,
    role: Role,
    now: NaiveDateTime,
) -> InviteResult<CallReviewer> {
    if role != Role::Reviewer {
        return Err(InviteError::NotAReviewer);
    }
    let token = token.trim().to_uppercase();

    conn.transaction(|conn| {
        let invite: ReviewerInvite = reviewer_invites::table
            .filter(reviewer_invites::token.eq(&token))
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(InviteError::NotFound)?;
        if invite.used {
            return Err(InviteError::AlreadyUsed);
        }
        if invite.expires_at <= now {
            return Err(InviteError::Expired);
        }

        let user: User = users::table.find(user_id).first(conn)?;
        if !user.email.eq_ignore_ascii_case(&invite.email) {
            return Err(InviteError::EmailMismatch);
        }

        diesel::update(reviewer_invites::table.find(invite.id))
            .set((
                reviewer_invites::used.eq(true),
                reviewer_invites::used_at.eq(Some(now)),
                reviewer_invites::used_by.eq(Some(user_id)),
            ))
            .execute(conn)?;

        let link = CallReviewer {
            call_id: invite.call_id,
            reviewer_id: user_id,
            added_at: now,
        };
        diesel::insert_into(call_reviewers::table)
            .values(&link)
            .on_conflict_do_nothing()
            .execute(conn)?;

        Ok(call_reviewers::table
            .find((invite.call_id, user_id))
            .first(conn)?)
    })
}

pub fn reviewer_calls(conn: &mut PgConnection, reviewer_id: Uuid) -> InviteResult<Vec<Call>> {
    Ok(calls::table
        .inner_join(call_reviewers::table)
        .filter(call_reviewers::reviewer_id.eq(reviewer_id))
        .order(calls::created_at.desc())
        .select(calls::all_columns)
        .load(conn)?)
}
