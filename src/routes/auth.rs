use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    auth::Role,
    error::{AppError, AppResult},
    notify,
    state::AppState,
    workflow::accounts::{self, LockoutPolicy, Registration, UserProfile},
};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<String>,
}

fn default_role() -> String {
    Role::Applicant.as_str().to_string()
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub role: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub role: Role,
}

#[derive(Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct PasswordResetConfirm {
    pub token: String,
    pub new_password: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<UserProfile>)> {
    let mut conn = state.db()?;
    let (user, token) = accounts::register(
        &mut conn,
        Registration {
            email: payload.email,
            password: payload.password,
            role: payload.role,
            first_name: payload.first_name,
            last_name: payload.last_name,
            organization: payload.organization,
        },
    )?;

    tracing::info!(user_id = %user.id, role = %user.role, "registered account");
    notify::dispatch(
        &state.notifier,
        notify::verification_email(&user.email, &state.config.public_base_url, &token),
    );

    Ok((StatusCode::CREATED, Json(UserProfile::from(&user))))
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let policy = LockoutPolicy {
        max_attempts: state.config.max_login_attempts,
        lockout: ChronoDuration::minutes(state.config.lockout_minutes),
    };
    let mut conn = state.db()?;
    let user = accounts::login(
        &mut conn,
        &payload.email,
        &payload.password,
        &payload.role,
        policy,
        Utc::now().naive_utc(),
    )?;

    let role = Role::parse(&user.role).ok_or_else(|| AppError::internal("stored role is invalid"))?;
    let access_token = state.jwt.generate_token(user.id, role)?;

    Ok(Json(LoginResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: state.jwt.expires_in_seconds(),
        role,
    }))
}

pub async fn verify_email(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Json<UserProfile>> {
    let mut conn = state.db()?;
    let user = accounts::verify_email(&mut conn, &token)?;
    Ok(Json(UserProfile::from(&user)))
}

/// Always 202 so the endpoint cannot be used to probe for accounts.
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<PasswordResetRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let mut conn = state.db()?;
    let valid_for = ChronoDuration::minutes(state.config.password_reset_expiry_minutes);
    if let Some((user, token)) =
        accounts::request_password_reset(&mut conn, &payload.email, valid_for, Utc::now().naive_utc())?
    {
        notify::dispatch(
            &state.notifier,
            notify::password_reset_email(&user.email, &state.config.public_base_url, &token),
        );
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "if the account exists, a reset link has been sent" })),
    ))
}

pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<PasswordResetConfirm>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    let user = accounts::confirm_password_reset(
        &mut conn,
        &payload.token,
        &payload.new_password,
        Utc::now().naive_utc(),
    )?;
    tracing::info!(user_id = %user.id, "password reset completed");
    Ok(StatusCode::NO_CONTENT)
}
