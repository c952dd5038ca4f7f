use std::any::Any;
use std::collections::BTreeSet;

use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put, MethodRouter},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{
    db::KeyLocks,
    error::AppError,
    security::{security_filter, HostPolicy, SecurityState},
    state::AppState,
    workflow::applications::blob_referenced,
};

pub mod applications;
pub mod auth;
pub mod calls;
pub mod health;
pub mod invites;
pub mod reviews;
pub mod users;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = build_cors(state.config.cors_allowed_origin.as_deref());
    let security = SecurityState::new(state.limiter.clone(), HostPolicy::from_config(&state.config));
    let body_limit = state.config.max_request_bytes;

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/verify/:token", post(auth::verify_email))
        .route("/password-reset", post(auth::request_password_reset))
        .route("/password-reset/confirm", post(auth::confirm_password_reset));

    let users_routes = Router::new()
        .route("/me", get(users::me).patch(users::update_me))
        .route("/admin/reviewers", get(users::list_reviewers))
        .route("/:id", delete(users::delete_user));

    let calls_routes = Router::new()
        .route(
            "/:id",
            get(calls::get_call)
                .put(calls::update_call)
                .delete(calls::delete_call),
        )
        .route("/:id/documents", get(calls::list_documents))
        .route("/:id/applications", get(calls::list_call_applications))
        .route("/:id/export-applications.pdf", get(calls::export_applications));

    let admin_calls_routes = Router::new()
        .route("/:id/documents", post(calls::add_document))
        .route(
            "/:id/documents/:doc_id",
            put(calls::update_document).delete(calls::delete_document),
        );

    let applications_routes = Router::new()
        .route("/me", get(applications::my_applications))
        .route("/assigned", get(applications::assigned_applications))
        .route("/by_call/:call_id", get(applications::get_or_create_for_call))
        .route(
            "/:id",
            get(applications::get_application).delete(applications::delete_application),
        )
        .route(
            "/:id/attachments",
            get(applications::list_attachments).post(applications::upload_attachments),
        )
        .route("/:id/confirm", patch(applications::confirm_attachments))
        .route("/:id/submit", patch(applications::submit_application))
        .route("/:id/cancel", patch(applications::cancel_application))
        .route(
            "/attachments/:id",
            delete(applications::delete_attachment),
        )
        .route(
            "/attachments/:id/download",
            get(applications::download_attachment),
        )
        .route(
            "/attachments/:id/confirm",
            patch(applications::confirm_attachment),
        )
        .route(
            "/admin/applications/:id/assign-reviewer",
            post(applications::assign_reviewer),
        )
        .route(
            "/admin/calls/:call_id/applications",
            get(applications::admin_list_for_call),
        );

    let reviews_routes = Router::new()
        .route("/me", get(reviews::my_reviews))
        .route("/applications/:id/my-review", get(reviews::my_review_for_application))
        .route("/applications/:id/reviews", get(reviews::application_reviews))
        .route("/applications/:id/summary", get(reviews::application_summary))
        .route(
            "/:id",
            patch(reviews::update_review).delete(reviews::delete_review),
        );

    let reviewer_routes = Router::new()
        .route("/invites/generate", post(invites::generate_invite))
        .route("/invites/accept", post(invites::accept_invite))
        .route("/calls", get(invites::reviewer_calls));

    Router::new()
        .nest("/auth", auth_routes)
        .merge(collection_root("/users", get(users::list_users)))
        .nest("/users", users_routes)
        .merge(collection_root(
            "/calls",
            get(calls::list_calls).post(calls::create_call),
        ))
        .nest("/calls", calls_routes)
        .nest("/admin/calls", admin_calls_routes)
        .merge(collection_root(
            "/applications",
            post(applications::create_application),
        ))
        .nest("/applications", applications_routes)
        .merge(collection_root("/reviews", post(reviews::create_review)))
        .nest("/reviews", reviews_routes)
        .merge(collection_root("/reviewer/invites", get(invites::list_invites)))
        .nest("/reviewer", reviewer_routes)
        .route("/health", get(health::health_check))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(security, security_filter))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Collection roots answer with and without the trailing slash.
fn collection_root(path: &str, handler: MethodRouter<AppState>) -> Router<AppState> {
    Router::new()
        .route(path, handler.clone())
        .route(&format!("{path}/"), handler)
}

fn build_cors(allowed: Option<&str>) -> CorsLayer {
    let allow_origin = match allowed {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        tracing::warn!(origin = value, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic payload".to_string()
    };
    AppError::internal(format!("handler panicked: {detail}")).into_response()
}

/// Deletes blobs no attachment row references anymore. Each key is checked
/// and deleted under its advisory lock, which uploads hold until their rows
/// commit. Failures are logged; an orphaned blob is reclaimed later by
/// `maintenance prune-blobs`.
pub(crate) async fn release_blobs(state: &AppState, keys: Vec<String>) {
    let keys: BTreeSet<String> = keys.into_iter().collect();
    if keys.is_empty() {
        return;
    }

    let mut conn = match state.db() {
        Ok(conn) => conn,
        Err(err) => {
            tracing::warn!(error = ?err, blobs = keys.len(), "no connection to release blobs");
            return;
        }
    };
    for key in keys {
        let mut locks = match KeyLocks::acquire(&mut conn, [key.as_str()]) {
            Ok(locks) => locks,
            Err(err) => {
                tracing::warn!(%key, error = %err, "failed to lock blob key");
                continue;
            }
        };
        match blob_referenced(locks.conn(), &key) {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = state.storage.delete_object(&key).await {
                    tracing::warn!(%key, error = %err, "failed to delete blob");
                }
            }
            Err(err) => tracing::warn!(%key, error = %err, "failed to check blob references"),
        }
        drop(locks);
    }
}
