use axum::http::StatusCode;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Application, NewReview, Review};
use crate::schema::{applications, reviews};
use crate::workflow::applications::{is_assigned_reviewer, ApplicationError, STATUS_SUBMITTED};
use crate::workflow::unique_violation;

pub const MIN_SCORE: i32 = 0;
pub const MAX_SCORE: i32 = 100;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("application not found")]
    ApplicationNotFound,
    #[error("review not found")]
    NotFound,
    #[error("reviewer is not assigned to this application")]
    NotAssigned,
    #[error("only submitted applications can be reviewed")]
    NotSubmitted,
    #[error("score must be between 0 and 100")]
    InvalidScore,
    #[error("review already submitted")]
    AlreadyReviewed,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type ReviewResult<T> = Result<T, ReviewError>;

impl From<ReviewError> for AppError {
    fn from(value: ReviewError) -> Self {
        let status = match value {
            ReviewError::Database(err) => return AppError::from(err),
            ReviewError::ApplicationNotFound | ReviewError::NotFound => StatusCode::NOT_FOUND,
            ReviewError::NotAssigned => StatusCode::FORBIDDEN,
            ReviewError::NotSubmitted | ReviewError::InvalidScore => StatusCode::BAD_REQUEST,
            ReviewError::AlreadyReviewed => StatusCode::CONFLICT,
        };
        AppError::new(status, value.to_string())
    }
}

pub fn validate_score(score: i32) -> ReviewResult<i32> {
    if (MIN_SCORE..=MAX_SCORE).contains(&score) {
        Ok(score)
    } else {
        Err(ReviewError::InvalidScore)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewPrecheck {
    Clear,
    AlreadyExists,
}

/// Fast-path duplicate check; the unique constraint remains authoritative.
pub fn precheck(
    conn: &mut PgConnection,
    application_id: Uuid,
    reviewer_id: Uuid,
) -> ReviewResult<ReviewPrecheck> {
    let existing = find_own_review(conn, application_id, reviewer_id)?;
    Ok(match existing {
        Some(_) => ReviewPrecheck::AlreadyExists,
        None => ReviewPrecheck::Clear,
    })
}

pub fn create_review(
    conn: &mut PgConnection,
    reviewer_id: Uuid,
    application_id: Uuid,
    score: i32,
    comment: Option<String>,
) -> ReviewResult<Review> {
    let score = validate_score(score)?;

    let application: Application = applications::table
        .find(application_id)
        .first(conn)
        .optional()?
        .ok_or(ReviewError::ApplicationNotFound)?;
    let assigned = is_assigned_reviewer(conn, &application, reviewer_id).map_err(|err| match err {
        ApplicationError::Database(err) => ReviewError::Database(err),
        _ => ReviewError::NotAssigned,
    })?;
    if !assigned {
        return Err(ReviewError::NotAssigned);
    }
    if application.status != STATUS_SUBMITTED {
        return Err(ReviewError::NotSubmitted);
    }

    if precheck(conn, application_id, reviewer_id)? == ReviewPrecheck::AlreadyExists {
        return Err(ReviewError::AlreadyReviewed);
    }

    let row = NewReview {
        id: Uuid::new_v4(),
        application_id,
        reviewer_id,
        score,
        comment: normalize_comment(comment),
    };
    insert_review(conn, &row)
}

/// A concurrent create that slipped past the precheck surfaces here as a
/// unique violation.
pub fn insert_review(conn: &mut PgConnection, row: &NewReview) -> ReviewResult<Review> {
    match diesel::insert_into(reviews::table)
        .values(row)
        .get_result(conn)
    {
        Ok(review) => Ok(review),
        Err(err) if unique_violation(&err).is_some() => Err(ReviewError::AlreadyReviewed),
        Err(err) => Err(err.into()),
    }
}

fn normalize_comment(comment: Option<String>) -> Option<String> {
    comment
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

pub fn find_own_review(
    conn: &mut PgConnection,
    application_id: Uuid,
    reviewer_id: Uuid,
) -> ReviewResult<Option<Review>> {
    Ok(reviews::table
        .filter(reviews::application_id.eq(application_id))
        .filter(reviews::reviewer_id.eq(reviewer_id))
        .first(conn)
        .optional()?)
}

pub fn list_by_reviewer(conn: &mut PgConnection, reviewer_id: Uuid) -> ReviewResult<Vec<Review>> {
    Ok(reviews::table
        .filter(reviews::reviewer_id.eq(reviewer_id))
        .order(reviews::submitted_at.desc())
        .load(conn)?)
}

pub fn list_for_application(
    conn: &mut PgConnection,
    application_id: Uuid,
) -> ReviewResult<Vec<Review>> {
    applications::table
        .find(application_id)
        .select(applications::id)
        .first::<Uuid>(conn)
        .optional()?
        .ok_or(ReviewError::ApplicationNotFound)?;
    Ok(reviews::table
        .filter(reviews::application_id.eq(application_id))
        .order(reviews::submitted_at.asc())
        .load(conn)?)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub review_count: usize,
    pub average_score: Option<f64>,
    pub min_score: Option<i32>,
    pub max_score: Option<i32>,
}

pub fn summarize(reviews: &[Review]) -> ScoreSummary {
    let scores: Vec<i32> = reviews.iter().map(|review| review.score).collect();
    let average_score = (!scores.is_empty())
        .then(|| scores.iter().map(|s| f64::from(*s)).sum::<f64>() / scores.len() as f64);
    ScoreSummary {
        review_count: scores.len(),
        average_score,
        min_score: scores.iter().copied().min(),
        max_score: scores.iter().copied().max(),
    }
}

pub fn update_review(
    conn: &mut PgConnection,
    review_id: Uuid,
    score: i32,
    comment: Option<String>,
) -> ReviewResult<Review> {
    let score = validate_score(score)?;
    let updated = diesel::update(reviews::table.find(review_id))
        .set((
            reviews::score.eq(score),
            reviews::comment.eq(normalize_comment(comment)),
            reviews::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .get_result(conn)
        .optional()?;
    updated.ok_or(ReviewError::NotFound)
}

pub fn delete_review(conn: &mut PgConnection, review_id: Uuid) -> ReviewResult<()> {
    let deleted = diesel::delete(reviews::table.find(review_id)).execute(conn)?;
    if deleted == 0 {
        return Err(ReviewError::NotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn review(score: i32) -> Review {
        let ts = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Review {
            id: Uuid::new_v4(),
            application_id: Uuid::nil(),
            reviewer_id: Uuid::new_v4(),
            score,
            comment: None,
            submitted_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn score_bounds_are_inclusive() {
        assert!(validate_score(0).is_ok());
        assert!(validate_score(100).is_ok());
        assert!(matches!(validate_score(-1), Err(ReviewError::InvalidScore)));
        assert!(matches!(validate_score(101), Err(ReviewError::InvalidScore)));
    }

    #[test]
    fn summary_aggregates_scores() {
        let summary = summarize(&[review(60), review(90), review(75)]);
        assert_eq!(summary.review_count, 3);
        assert_eq!(summary.average_score, Some(75.0));
        assert_eq!(summary.min_score, Some(60));
        assert_eq!(summary.max_score, Some(90));

        let empty = summarize(&[]);
        assert_eq!(empty.review_count, 0);
        assert_eq!(empty.average_score, None);
    }

    #[test]
    fn blank_comments_are_dropped() {
        assert_eq!(normalize_comment(Some("  ".into())), None);
        assert_eq!(normalize_comment(Some(" solid ".into())).as_deref(), Some("solid"));
    }

    #[test]
    fn duplicate_maps_to_conflict() {
        let err = AppError::from(ReviewError::AlreadyReviewed);
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.message(), "review already submitted");
    }
}
