//! Registration, login bookkeeping (attempt counter and lockout), email
//! verification, password reset and administrative account removal.

use axum::http::StatusCode;
use chrono::{Duration, NaiveDateTime};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::{password, Role};
use crate::error::AppError;
use crate::models::{NewUser, User};
use crate::schema::{application_reviewers, applications, call_reviewers, reviewer_invites, reviews, users};
use crate::workflow::applications::delete_applications_ordered;
use crate::workflow::{random_token, unique_violation};

const MAX_EMAIL_LENGTH: usize = 255;
const MAX_NAME_LENGTH: usize = 50;
const MAX_ORGANIZATION_LENGTH: usize = 100;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("email already registered")]
    EmailTaken,
    #[error("{0}")]
    Invalid(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked, try again later")]
    Locked,
    #[error("account is inactive")]
    Inactive,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("user not found")]
    NotFound,
    #[error("administrators cannot delete their own account")]
    CannotDeleteSelf,
    #[error("current password is incorrect")]
    WrongPassword,
    #[error("password hashing failed: {0}")]
    Hashing(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type AccountResult<T> = Result<T, AccountError>;

impl From<AccountError> for AppError {
    fn from(value: AccountError) -> Self {
        let status = match value {
            AccountError::Database(err) => return AppError::from(err),
            AccountError::Hashing(_) => return AppError::internal(value),
            AccountError::EmailTaken => StatusCode::CONFLICT,
            AccountError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AccountError::Locked => StatusCode::LOCKED,
            AccountError::Inactive => StatusCode::FORBIDDEN,
            AccountError::NotFound => StatusCode::NOT_FOUND,
            AccountError::Invalid(_)
            | AccountError::InvalidToken
            | AccountError::CannotDeleteSelf
            | AccountError::WrongPassword => StatusCode::BAD_REQUEST,
        };
        AppError::new(status, value.to_string())
    }
}

/// Public view of an account; never carries hashes or tokens.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<String>,
    pub is_active: bool,
    pub is_verified: bool,
    pub last_login: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            role: user.role.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            organization: user.organization.clone(),
            is_active: user.is_active,
            is_verified: user.is_verified,
            last_login: user.last_login,
            created_at: user.created_at,
        }
    }
}

pub fn normalize_email(raw: &str) -> AccountResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        }
        None => false,
    };
    if !valid || email.len() > MAX_EMAIL_LENGTH || email.chars().any(char::is_whitespace) {
        return Err(AccountError::Invalid("invalid email address".into()));
    }
    Ok(email)
}

fn clean_optional(value: Option<String>, field: &str, max: usize) -> AccountResult<Option<String>> {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) if v.chars().count() > max => Err(AccountError::Invalid(format!(
            "{field} must be at most {max} characters"
        ))),
        other => Ok(other),
    }
}

fn hash(password: &str) -> AccountResult<String> {
    password::validate_password_strength(password)
        .map_err(|reason| AccountError::Invalid(reason.to_string()))?;
    password::hash_password(password).map_err(|err| AccountError::Hashing(err.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<String>,
}

/// Self-service registration; only applicants and reviewers. Returns the
/// new user together with the verification token to deliver.
pub fn register(conn: &mut PgConnection, input: Registration) -> AccountResult<(User, String)> {
    let role = match Role::parse(&input.role) {
        Some(Role::Admin) => {
            return Err(AccountError::Invalid(
                "admin accounts cannot be self-registered".into(),
            ))
        }
        Some(role) => role,
        None => return Err(AccountError::Invalid("role must be applicant or reviewer".into())),
    };
    let token = random_token();
    let user = insert_user(conn, input, role, false, Some(token.clone()))?;
    Ok((user, token))
}

/// Operator path for bootstrapping administrators; the account starts verified.
pub fn create_user_with_role(
    conn: &mut PgConnection,
    input: Registration,
    role: Role,
) -> AccountResult<User> {
    insert_user(conn, input, role, true, None)
}

fn insert_user(
    conn: &mut PgConnection,
    input: Registration,
    role: Role,
    is_verified: bool,
    verification_token: Option<String>,
) -> AccountResult<User> {
    let email = normalize_email(&input.email)?;
    let row = NewUser {
        id: Uuid::new_v4(),
        password_hash: hash(&input.password)?,
        role: role.as_str().to_string(),
        first_name: clean_optional(input.first_name, "first_name", MAX_NAME_LENGTH)?,
        last_name: clean_optional(input.last_name, "last_name", MAX_NAME_LENGTH)?,
        organization: clean_optional(input.organization, "organization", MAX_ORGANIZATION_LENGTH)?,
        email,
        is_verified,
        verification_token,
    };

    let taken = diesel::select(diesel::dsl::exists(
        users::table.filter(users::email.eq(&row.email)),
    ))
    .get_result::<bool>(conn)?;
    if taken {
        return Err(AccountError::EmailTaken);
    }

    match diesel::insert_into(users::table).values(&row).get_result(conn) {
        Ok(user) => Ok(user),
        Err(err) if unique_violation(&err).is_some() => Err(AccountError::EmailTaken),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub max_attempts: i32,
    pub lockout: Duration,
}

enum LoginOutcome {
    Success(User),
    Failed,
    Locked,
    Inactive,
}

/// Checks credentials and the asserted role under a row lock so concurrent
/// failures cannot lose counter updates. Failed attempts are committed even
/// though the call reports an error.
pub fn login(
    conn: &mut PgConnection,
    email: &str,
    secret: &str,
    asserted_role: &str,
    policy: LockoutPolicy,
    now: NaiveDateTime,
) -> AccountResult<User> {
    let email = email.trim().to_lowercase();
    let outcome = conn.transaction::<_, AccountError, _>(|conn| {
        let Some(mut user) = users::table
            .filter(users::email.eq(&email))
            .for_update()
            .first::<User>(conn)
            .optional()?
        else {
            return Ok(LoginOutcome::Failed);
        };

        match user.locked_until {
            Some(until) if until > now => return Ok(LoginOutcome::Locked),
            Some(_) => {
                user.login_attempts = 0;
                user.locked_until = None;
            }
            None => {}
        }

        let password_ok = password::verify_password(secret, &user.password_hash)
            .map_err(|err| AccountError::Hashing(err.to_string()))?;
        let role_ok = Role::parse(asserted_role)
            .is_some_and(|role| Some(role) == Role::parse(&user.role));

        if !(password_ok && role_ok) {
            let attempts = user.login_attempts + 1;
            let locked_until = (attempts >= policy.max_attempts).then(|| now + policy.lockout);
            diesel::update(users::table.find(user.id))
                .set((
                    users::login_attempts.eq(attempts),
                    users::locked_until.eq(locked_until),
                    users::updated_at.eq(now),
                ))
                .execute(conn)?;
            if locked_until.is_some() {
                tracing::warn!(user_id = %user.id, attempts, "account locked after failed logins");
            }
            return Ok(LoginOutcome::Failed);
        }

        if !user.is_active {
            return Ok(LoginOutcome::Inactive);
        }

        let user = diesel::update(users::table.find(user.id))
            .set((
                users::login_attempts.eq(0),
                users::locked_until.eq(None::<NaiveDateTime>),
                users::last_login.eq(Some(now)),
                users::updated_at.eq(now),
            ))
            .get_result(conn)?;
        Ok(LoginOutcome::Success(user))
    })?;

    match outcome {
        LoginOutcome::Success(user) => Ok(user),
        LoginOutcome::Failed => Err(AccountError::InvalidCredentials),
        LoginOutcome::Locked => Err(AccountError::Locked),
        LoginOutcome::Inactive => Err(AccountError::Inactive),
    }
}

pub fn verify_email(conn: &mut PgConnection, token: &str) -> AccountResult<User> {
    let updated = diesel::update(users::table.filter(users::verification_token.eq(token)))
        .set((
            users::is_verified.eq(true),
            users::verification_token.eq(None::<String>),
            users::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .get_result(conn)
        .optional()?;
    updated.ok_or(AccountError::InvalidToken)
}

/// `None` when no account matches; callers must not reveal which.
pub fn request_password_reset(
    conn: &mut PgConnection,
    email: &str,
    valid_for: Duration,
    now: NaiveDateTime,
) -> AccountResult<Option<(User, String)>> {
    let email = email.trim().to_lowercase();
    let token = random_token();
    let updated = diesel::update(
        users::table
            .filter(users::email.eq(&email))
            .filter(users::is_active.eq(true)),
    )
    .set((
        users::password_reset_token.eq(Some(token.clone())),
        users::password_reset_expires.eq(Some(now + valid_for)),
        users::updated_at.eq(now),
    ))
    .get_result::<User>(conn)
    .optional()?;
    Ok(updated.map(|user| (user, token)))
}

pub fn confirm_password_reset(
    conn: &mut PgConnection,
    token: &str,
    new_password: &str,
    now: NaiveDateTime,
) -> AccountResult<User> {
    let password_hash = hash(new_password)?;
    let updated = diesel::update(
        users::table
            .filter(users::password_reset_token.eq(token))
            .filter(users::password_reset_expires.gt(now)),
    )
    .set((
        users::password_hash.eq(password_hash),
        users::password_reset_token.eq(None::<String>),
        users::password_reset_expires.eq(None::<NaiveDateTime>),
        users::login_attempts.eq(0),
        users::locked_until.eq(None::<NaiveDateTime>),
        users::updated_at.eq(now),
    ))
    .get_result(conn)
    .optional()?;
    updated.ok_or(AccountError::InvalidToken)
}

pub fn get_user(conn: &mut PgConnection, user_id: Uuid) -> AccountResult<User> {
    users::table
        .find(user_id)
        .first(conn)
        .optional()?
        .ok_or(AccountError::NotFound)
}

/// Three-state profile fields: `None` leaves the column alone,
/// `Some(None)` clears it.
#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub first_name: Option<Option<String>>,
    pub last_name: Option<Option<String>>,
    pub organization: Option<Option<String>>,
    pub password: Option<String>,
    pub current_password: Option<String>,
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = users)]
struct ProfileChangeset {
    first_name: Option<Option<String>>,
    last_name: Option<Option<String>>,
    organization: Option<Option<String>>,
    password_hash: Option<String>,
    updated_at: Option<NaiveDateTime>,
}

pub fn update_profile(
    conn: &mut PgConnection,
    user_id: Uuid,
    update: ProfileUpdate,
) -> AccountResult<User> {
    let user = get_user(conn, user_id)?;

    let mut changes = ProfileChangeset {
        updated_at: Some(chrono::Utc::now().naive_utc()),
        ..Default::default()
    };
    if let Some(value) = update.first_name {
        changes.first_name = Some(clean_optional(value, "first_name", MAX_NAME_LENGTH)?);
    }
    if let Some(value) = update.last_name {
        changes.last_name = Some(clean_optional(value, "last_name", MAX_NAME_LENGTH)?);
    }
    if let Some(value) = update.organization {
        changes.organization =
            Some(clean_optional(value, "organization", MAX_ORGANIZATION_LENGTH)?);
    }
    if let Some(new_password) = update.password {
        let current = update.current_password.unwrap_or_default();
        let matches = password::verify_password(&current, &user.password_hash)
            .map_err(|err| AccountError::Hashing(err.to_string()))?;
        if !matches {
            return Err(AccountError::WrongPassword);
        }
        changes.password_hash = Some(hash(&new_password)?);
    }

    Ok(diesel::update(users::table.find(user_id))
        .set(&changes)
        .get_result(conn)?)
}

pub fn list_users(conn: &mut PgConnection, role: Option<Role>) -> AccountResult<Vec<User>> {
    let mut query = users::table.order(users::created_at.asc()).into_boxed();
    if let Some(role) = role {
        query = query.filter(users::role.eq(role.as_str()));
    }
    Ok(query.load(conn)?)
}

pub fn list_reviewers(conn: &mut PgConnection) -> AccountResult<Vec<User>> {
    Ok(users::table
        .filter(users::role.eq(Role::Reviewer.as_str()))
        .filter(users::is_active.eq(true))
        .order(users::email.asc())
        .load(conn)?)
}

/// Removes the account and everything hanging off it in one transaction.
/// Invites keep their history with the user reference cleared. Returns the
/// storage keys of removed attachments.
pub fn delete_user(
    conn: &mut PgConnection,
    actor_id: Uuid,
    user_id: Uuid,
) -> AccountResult<Vec<String>> {
    if actor_id == user_id {
        return Err(AccountError::CannotDeleteSelf);
    }
    conn.transaction(|conn| {
        users::table
            .find(user_id)
            .for_update()
            .first::<User>(conn)
            .optional()?
            .ok_or(AccountError::NotFound)?;

        let owned: Vec<Uuid> = applications::table
            .filter(applications::user_id.eq(user_id))
            .select(applications::id)
            .load(conn)?;
        let keys = delete_applications_ordered(conn, &owned)?;

        diesel::delete(reviews::table.filter(reviews::reviewer_id.eq(user_id))).execute(conn)?;
        diesel::delete(
            application_reviewers::table.filter(application_reviewers::user_id.eq(user_id)),
        )
        .execute(conn)?;
        diesel::delete(call_reviewers::table.filter(call_reviewers::reviewer_id.eq(user_id)))
            .execute(conn)?;
        diesel::update(reviewer_invites::table.filter(reviewer_invites::used_by.eq(user_id)))
            .set(reviewer_invites::used_by.eq(None::<Uuid>))
            .execute(conn)?;
        diesel::update(reviewer_invites::table.filter(reviewer_invites::created_by.eq(user_id)))
            .set(reviewer_invites::created_by.eq(None::<Uuid>))
            .execute(conn)?;
        diesel::delete(users::table.find(user_id)).execute(conn)?;
        Ok(keys)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  Ada@Example.ORG ").unwrap(), "ada@example.org");
        for bad in ["", "ada", "@example.org", "ada@example", "ada@.org", "a da@example.org"] {
            assert!(normalize_email(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn optional_fields_are_trimmed_and_bounded() {
        assert_eq!(clean_optional(Some("  ".into()), "f", 5).unwrap(), None);
        assert_eq!(clean_optional(Some(" ada ".into()), "f", 5).unwrap().as_deref(), Some("ada"));
        assert!(clean_optional(Some("abcdef".into()), "f", 5).is_err());
    }

    #[test]
    fn weak_passwords_fail_before_hashing() {
        assert!(matches!(hash("short"), Err(AccountError::Invalid(_))));
    }

    #[test]
    fn error_statuses() {
        assert_eq!(AppError::from(AccountError::Locked).status(), StatusCode::LOCKED);
        assert_eq!(AppError::from(AccountError::Inactive).status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::from(AccountError::EmailTaken).status(), StatusCode::CONFLICT);
        let err = AppError::from(AccountError::InvalidCredentials);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.message(), "invalid credentials");
        let err = AppError::from(AccountError::Hashing("boom".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), crate::error::INTERNAL_ERROR_MESSAGE);
    }
}
