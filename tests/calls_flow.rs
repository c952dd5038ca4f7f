mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, json_body, TestApp};
use serde_json::{json, Value};

#[tokio::test]
async fn admin_creates_call_with_definitions() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, admin) = app.user_with_token("admin@example.org", "admin").await?;
    let created = app
        .create_call(
            &admin,
            json!({
                "title": "  Research Fund 2025 ",
                "status": "published",
                "category": "science",
                "document_definitions": [
                    { "name": "CV", "allowed_formats": "pdf" },
                    { "name": "Portfolio", "allowed_formats": "image, pdf" }
                ]
            }),
        )
        .await?;
    assert_eq!(created["title"], "Research Fund 2025");
    assert_eq!(created["status"], "PUBLISHED");
    assert_eq!(created["is_active"], true);

    let id = created["id"].as_str().expect("call id").to_string();
    let response = app.get(&format!("/calls/{id}"), None).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let call: Value = json_body(response).await?;
    let definitions = call["document_definitions"].as_array().expect("definitions");
    assert_eq!(definitions.len(), 2);
    assert!(definitions
        .iter()
        .any(|def| def["allowed_formats"] == "pdf,image"));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn draft_calls_are_hidden_from_open_listing() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, admin) = app.user_with_token("admin@example.org", "admin").await?;
    app.create_call(&admin, json!({ "title": "Draft call" })).await?;
    app.create_call(&admin, json!({ "title": "Live call", "status": "PUBLISHED" }))
        .await?;
    app.create_call(
        &admin,
        json!({ "title": "Paused call", "status": "PUBLISHED", "is_open": false }),
    )
    .await?;

    let response = app.get("/calls?only_open=true", None).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let open: Vec<Value> = json_body(response).await?;
    let titles: Vec<&str> = open.iter().filter_map(|c| c["title"].as_str()).collect();
    assert_eq!(titles, vec!["Live call"]);

    let response = app.get("/calls/", None).await?;
    let all: Vec<Value> = json_body(response).await?;
    assert_eq!(all.len(), 3);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn call_management_requires_admin() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, applicant) = app
        .user_with_token("applicant@example.org", "applicant")
        .await?;
    let response = app
        .post_json("/calls/", &json!({ "title": "Sneaky call" }), Some(&applicant))
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .post_json("/calls/", &json!({ "title": "Anonymous call" }), None)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_calls_are_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, admin) = app.user_with_token("admin@example.org", "admin").await?;
    let cases = [
        json!({ "title": "ab" }),
        json!({ "title": "Closed at birth", "status": "CLOSED" }),
        json!({
            "title": "Backwards window",
            "start_date": "2025-06-01T00:00:00Z",
            "end_date": "2025-05-01T00:00:00Z"
        }),
        json!({ "title": "Zero cap", "max_applications": 0 }),
        json!({
            "title": "Bad formats",
            "document_definitions": [{ "name": "CV", "allowed_formats": "docx" }]
        }),
    ];
    for payload in &cases {
        let response = app.post_json("/calls/", payload, Some(&admin)).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "payload {payload}");
    }

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn admin_manages_document_definitions() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, admin) = app.user_with_token("admin@example.org", "admin").await?;
    let call = app
        .create_call(&admin, json!({ "title": "Docs call", "status": "PUBLISHED" }))
        .await?;
    let call_id = call["id"].as_str().expect("call id").to_string();

    let response = app
        .post_json(
            &format!("/admin/calls/{call_id}/documents"),
            &json!({ "name": "Budget", "allowed_formats": "text" }),
            Some(&admin),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let definition: Value = json_body(response).await?;
    let doc_id = definition["id"].as_str().expect("doc id").to_string();

    let response = app
        .put_json(
            &format!("/admin/calls/{call_id}/documents/{doc_id}"),
            &json!({ "name": "Budget plan", "allowed_formats": "pdf" }),
            Some(&admin),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .get(&format!("/calls/{call_id}/documents"), Some(&admin))
        .await?;
    let listed: Vec<Value> = json_body(response).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["name"], "Budget plan");

    let response = app
        .delete(
            &format!("/admin/calls/{call_id}/documents/{doc_id}"),
            Some(&admin),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    app.cleanup().await?;
    Ok(())
}
