use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    auth::{AuthenticatedUser, Role},
    error::{AppError, AppResult},
    state::AppState,
    utils::json::nullable_field,
    workflow::accounts::{self, ProfileUpdate, UserProfile},
};

use super::release_blobs;

#[derive(Deserialize)]
pub struct UserListQuery {
    pub role: Option<String>,
}

pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UserProfile>> {
    let mut conn = state.db()?;
    let account = accounts::get_user(&mut conn, user.user_id)?;
    Ok(Json(UserProfile::from(&account)))
}

pub async fn update_me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<Value>,
) -> AppResult<Json<UserProfile>> {
    if !body.is_object() {
        return Err(AppError::bad_request("expected a JSON object"));
    }
    let update = ProfileUpdate {
        first_name: nullable_field(&body, "first_name").map_err(AppError::bad_request)?,
        last_name: nullable_field(&body, "last_name").map_err(AppError::bad_request)?,
        organization: nullable_field(&body, "organization").map_err(AppError::bad_request)?,
        password: string_field(&body, "password")?,
        current_password: string_field(&body, "current_password")?,
    };

    let mut conn = state.db()?;
    let account = accounts::update_profile(&mut conn, user.user_id, update)?;
    Ok(Json(UserProfile::from(&account)))
}

fn string_field(body: &Value, field: &str) -> AppResult<Option<String>> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(AppError::bad_request(format!("{field} must be a string"))),
    }
}

pub async fn list_users(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<UserListQuery>,
) -> AppResult<Json<Vec<UserProfile>>> {
    user.require(&[Role::Admin])?;
    let role = match query.role.as_deref() {
        Some(raw) => Some(Role::parse(raw).ok_or_else(|| AppError::bad_request("unknown role"))?),
        None => None,
    };

    let mut conn = state.db()?;
    let users = accounts::list_users(&mut conn, role)?;
    Ok(Json(users.iter().map(UserProfile::from).collect()))
}

pub async fn list_reviewers(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<UserProfile>>> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    let reviewers = accounts::list_reviewers(&mut conn)?;
    Ok(Json(reviewers.iter().map(UserProfile::from).collect()))
}

pub async fn delete_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    user.require(&[Role::Admin])?;
    let keys = {
        let mut conn = state.db()?;
        accounts::delete_user(&mut conn, user.user_id, user_id)?
    };
    tracing::info!(actor = %user.user_id, %user_id, attachments = keys.len(), "deleted user");
    release_blobs(&state, keys).await;
    Ok(StatusCode::NO_CONTENT)
}
