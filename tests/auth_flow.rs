mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, json_body, TestApp, PASSWORD};
use chrono::{Duration, NaiveDateTime, Utc};
use diesel::prelude::*;
use grantdesk::notify::NotificationKind;
use grantdesk::workflow::accounts::{self, AccountError, LockoutPolicy};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct Profile {
    email: String,
    role: String,
    first_name: Option<String>,
    is_verified: bool,
}

#[tokio::test]
async fn register_login_and_me() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let response = app
        .post_json(
            "/auth/register",
            &json!({ "email": "Alice@Example.org", "password": PASSWORD }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let profile: Profile = json_body(response).await?;
    assert_eq!(profile.email, "alice@example.org");
    assert_eq!(profile.role, "applicant");
    assert!(!profile.is_verified);

    let sent = app
        .wait_for_notification(NotificationKind::EmailVerification)
        .await
        .expect("verification email");
    assert_eq!(sent.recipient, "alice@example.org");

    let token = app
        .login_token("alice@example.org", PASSWORD, "applicant")
        .await?;
    let response = app.get("/users/me", Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let me: Profile = json_body(response).await?;
    assert_eq!(me.email, "alice@example.org");

    let response = app
        .post_json(
            "/auth/register",
            &json!({ "email": "alice@example.org", "password": PASSWORD }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn admin_cannot_self_register() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let response = app
        .post_json(
            "/auth/register",
            &json!({ "email": "root@example.org", "password": PASSWORD, "role": "admin" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn role_mismatch_counts_towards_lockout() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("bob@example.org", PASSWORD, "applicant")
        .await?;

    let attempts = [
        json!({ "email": "bob@example.org", "password": PASSWORD, "role": "reviewer" }),
        json!({ "email": "bob@example.org", "password": "wrong-password", "role": "applicant" }),
        json!({ "email": "bob@example.org", "password": PASSWORD, "role": "admin" }),
    ];
    for payload in &attempts {
        let response = app.post_json("/auth/login", payload, None).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // Correct credentials are refused while the lock holds.
    let response = app
        .post_json(
            "/auth/login",
            &json!({ "email": "bob@example.org", "password": PASSWORD, "role": "applicant" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::LOCKED);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn lock_lifts_once_it_expires() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("dave@example.org", PASSWORD, "applicant")
        .await?;

    app.with_conn(|conn| {
        use grantdesk::schema::users;

        let policy = LockoutPolicy {
            max_attempts: 2,
            lockout: Duration::minutes(15),
        };
        let email = "dave@example.org";
        let start = Utc::now().naive_utc();

        for _ in 0..2 {
            let failed = accounts::login(conn, email, "wrong-password", "applicant", policy, start);
            assert!(matches!(failed, Err(AccountError::InvalidCredentials)));
        }
        let during = accounts::login(
            conn,
            email,
            PASSWORD,
            "applicant",
            policy,
            start + Duration::minutes(14),
        );
        assert!(matches!(during, Err(AccountError::Locked)));

        // After expiry a single miss starts a fresh count instead of relocking.
        let after = start + Duration::minutes(16);
        let miss = accounts::login(conn, email, "wrong-password", "applicant", policy, after);
        assert!(matches!(miss, Err(AccountError::InvalidCredentials)));
        let (attempts, locked_until): (i32, Option<NaiveDateTime>) = users::table
            .filter(users::email.eq(email))
            .select((users::login_attempts, users::locked_until))
            .first(conn)?;
        assert_eq!(attempts, 1);
        assert!(locked_until.is_none());

        let user = accounts::login(conn, email, PASSWORD, "applicant", policy, after)?;
        assert_eq!(user.login_attempts, 0);
        assert!(user.locked_until.is_none());
        Ok(())
    })
    .await?;

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn successful_login_resets_failed_attempts() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("carol@example.org", PASSWORD, "reviewer")
        .await?;
    for _ in 0..2 {
        let response = app
            .post_json(
                "/auth/login",
                &json!({ "email": "carol@example.org", "password": "nope-nope", "role": "reviewer" }),
                None,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    app.login_token("carol@example.org", PASSWORD, "reviewer")
        .await?;

    let attempts: i32 = app
        .with_conn(|conn| {
            use grantdesk::schema::users;
            Ok(users::table
                .filter(users::email.eq("carol@example.org"))
                .select(users::login_attempts)
                .first(conn)?)
        })
        .await?;
    assert_eq!(attempts, 0);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn password_reset_round_trip() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("dana@example.org", PASSWORD, "applicant")
        .await?;

    let response = app
        .post_json(
            "/auth/password-reset",
            &json!({ "email": "nobody@example.org" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .post_json(
            "/auth/password-reset",
            &json!({ "email": "dana@example.org" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let token: String = app
        .with_conn(|conn| {
            use grantdesk::schema::users;
            let token: Option<String> = users::table
                .filter(users::email.eq("dana@example.org"))
                .select(users::password_reset_token)
                .first(conn)?;
            token.ok_or_else(|| anyhow::anyhow!("reset token missing"))
        })
        .await?;

    let response = app
        .post_json(
            "/auth/password-reset/confirm",
            &json!({ "token": token, "new_password": "brand-new-pass" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    app.login_token("dana@example.org", "brand-new-pass", "applicant")
        .await?;

    let response = app
        .post_json(
            "/auth/password-reset/confirm",
            &json!({ "token": token, "new_password": "another-pass" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn profile_patch_distinguishes_null_from_omitted() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, token) = app.user_with_token("erin@example.org", "applicant").await?;

    let response = app
        .patch_json("/users/me", &json!({ "first_name": "Erin" }), Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let profile: Profile = json_body(response).await?;
    assert_eq!(profile.first_name.as_deref(), Some("Erin"));

    let response = app
        .patch_json("/users/me", &json!({ "last_name": "Stone" }), Some(&token))
        .await?;
    let profile: Profile = json_body(response).await?;
    assert_eq!(profile.first_name.as_deref(), Some("Erin"));

    let response = app
        .patch_json("/users/me", &json!({ "first_name": null }), Some(&token))
        .await?;
    let profile: Profile = json_body(response).await?;
    assert_eq!(profile.first_name, None);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn missing_or_invalid_tokens_are_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let response = app.get("/users/me", None).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = app.get("/users/me", Some("not-a-jwt")).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await?;
    Ok(())
}
