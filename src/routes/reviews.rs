use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::{AuthenticatedUser, Role},
    error::{AppError, AppResult},
    models::Review,
    state::AppState,
    workflow::reviews::{self as flow, ScoreSummary},
};

#[derive(Deserialize)]
pub struct CreateReviewRequest {
    pub application_id: Uuid,
    pub score: i32,
    pub comment: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateReviewRequest {
    pub score: i32,
    pub comment: Option<String>,
}

#[derive(Serialize)]
pub struct ApplicationSummary {
    pub application_id: Uuid,
    #[serde(flatten)]
    pub summary: ScoreSummary,
}

pub async fn create_review(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateReviewRequest>,
) -> AppResult<(StatusCode, Json<Review>)> {
    user.require(&[Role::Reviewer])?;
    let mut conn = state.db()?;
    let review = flow::create_review(
        &mut conn,
        user.user_id,
        payload.application_id,
        payload.score,
        payload.comment,
    )?;
    tracing::info!(review_id = %review.id, application_id = %review.application_id, "review submitted");
    Ok((StatusCode::CREATED, Json(review)))
}

pub async fn my_reviews(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Review>>> {
    user.require(&[Role::Reviewer])?;
    let mut conn = state.db()?;
    Ok(Json(flow::list_by_reviewer(&mut conn, user.user_id)?))
}

pub async fn my_review_for_application(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
) -> AppResult<Json<Review>> {
    user.require(&[Role::Reviewer])?;
    let mut conn = state.db()?;
    flow::find_own_review(&mut conn, application_id, user.user_id)?
        .map(Json)
        .ok_or_else(AppError::not_found)
}

pub async fn application_reviews(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
) -> AppResult<Json<Vec<Review>>> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    Ok(Json(flow::list_for_application(&mut conn, application_id)?))
}

pub async fn application_summary(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(application_id): Path<Uuid>,
) -> AppResult<Json<ApplicationSummary>> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    let reviews = flow::list_for_application(&mut conn, application_id)?;
    Ok(Json(ApplicationSummary {
        application_id,
        summary: flow::summarize(&reviews),
    }))
}

pub async fn update_review(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(review_id): Path<Uuid>,
    Json(payload): Json<UpdateReviewRequest>,
) -> AppResult<Json<Review>> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    let review = flow::update_review(&mut conn, review_id, payload.score, payload.comment)?;
    tracing::info!(actor = %user.user_id, %review_id, "review updated");
    Ok(Json(review))
}

pub async fn delete_review(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(review_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    user.require(&[Role::Admin])?;
    let mut conn = state.db()?;
    flow::delete_review(&mut conn, review_id)?;
    tracing::info!(actor = %user.user_id, %review_id, "review deleted");
    Ok(StatusCode::NO_CONTENT)
}
