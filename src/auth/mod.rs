pub mod jwt;
pub mod password;
pub mod roles;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::User,
    schema::users,
    state::AppState,
};

pub use roles::Role;

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
}

impl AuthenticatedUser {
    /// Rejects with 403 unless the caller holds one of `allowed`.
    pub fn require(&self, allowed: &[Role]) -> AppResult<()> {
        match roles::authorize(self.role, allowed) {
            roles::Authorization::Granted => Ok(()),
            roles::Authorization::Denied { held } => {
                tracing::debug!(user_id = %self.user_id, role = %held, "role check denied");
                Err(AppError::forbidden("insufficient permissions"))
            }
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        let claims = state
            .jwt
            .verify_token(bearer.token())
            .map_err(|_| AppError::unauthorized())?;

        let mut conn = state.db()?;
        let user: User = users::table
            .find(claims.sub)
            .first(&mut conn)
            .optional()?
            .ok_or_else(AppError::unauthorized)?;

        // Tokens outlive neither deactivation nor a role change.
        let role = Role::parse(&user.role).ok_or_else(AppError::unauthorized)?;
        if !user.is_active || role != claims.role {
            return Err(AppError::unauthorized());
        }

        Ok(AuthenticatedUser {
            user_id: user.id,
            email: user.email,
            role,
        })
    }
}
