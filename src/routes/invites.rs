use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::{AuthenticatedUser, Role},
    error::AppResult,
    models::{Call, CallReviewer, ReviewerInvite},
    notify,
    state::AppState,
    workflow::invites as flow,
};

#[derive(Deserialize)]
pub struct GenerateInviteRequest {
    pub call_id: Uuid,
    pub email: String,
    pub expiration_hours: Option<i64>,
}

#[derive(Deserialize)]
pub struct AcceptInviteRequest {
    pub token: String,
}

#[derive(Deserialize)]
pub struct InviteListQuery {
    pub call_id: Option<Uuid>,
}

pub async fn generate_invite(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<GenerateInviteRequest>,
) -> AppResult<(StatusCode, Json<ReviewerInvite>)> {
    user.require(&[Role::Admin])?;
    let hours = payload
        .expiration_hours
        .unwrap_or(state.config.invite_expiry_hours);

    let mut conn = state.db()?;
    let (invite, call) = flow::create_invite(
        &mut conn,
        payload.call_id,
        &payload.email,
        hours,
        user.user_id,
        Utc::now().naive_utc(),
    )?;

    tracing::info!(invite_id = %invite.id, call_id = %call.id, "reviewer invite issued");
    notify::dispatch(
        &state.notifier,
        notify::reviewer_invite_email(
            &invite.email,
            &state.config.public_base_url,
            &call.title,
            &invite.token,
        ),
    );
    Ok((StatusCode::CREATED, Json(invite)))
}

pub async fn list_invites(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<InviteListQuery>,
) -> AppResult<Json<Vec<ReviewerInvite>>> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    Ok(Json(flow::list_invites(&mut conn, query.call_id)?))
}

pub async fn accept_invite(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<AcceptInviteRequest>,
) -> AppResult<Json<CallReviewer>> {
    let mut conn = state.db()?;
    let link = flow::accept_invite(
        &mut conn,
        &payload.token,
        user.user_id,
        user.role,
        Utc::now().naive_utc(),
    )?;
    tracing::info!(reviewer_id = %user.user_id, call_id = %link.call_id, "invite accepted");
    Ok(Json(link))
}

pub async fn reviewer_calls(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Call>>> {
    user.require(&[Role::Reviewer])?;
    let mut conn = state.db()?;
    Ok(Json(flow::reviewer_calls(&mut conn, user.user_id)?))
}
