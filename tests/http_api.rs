mod common;

use attachments::{
    app,
    handlers::USER_HEADER,
    models::property::{DataKind, PropertyDefinition},
    services::property_schema::StaticPropertySchema,
};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use common::{Harness, PDF};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "X-ATTACHMENTS-TEST-BOUNDARY";
const LIMIT: usize = 1024 * 1024;

fn multipart_body(filename: &str, data: &[u8], fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"attachment\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(session_id: &str, body: Vec<u8>) -> Request<Body> {
    Request::post(format!("/sessions/{}/uploads", session_id))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(USER_HEADER, "alice")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, header::HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn new_session(router: &Router, body: Value) -> String {
    let (status, json) = send_json(router, json_request("POST", "/sessions", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    json["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_endpoints_answer() {
    let h = Harness::new().await;
    let router = app(h.engine.clone(), LIMIT);

    let (status, json) = send_json(&router, Request::get("/healthz").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");

    let (status, json) = send_json(&router, Request::get("/readyz").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["checks"]["sqlite"]["ok"], true);
    assert_eq!(json["checks"]["staging"]["ok"], true);
}

#[tokio::test]
async fn upload_attach_and_download() {
    let h = Harness::new().await;
    let router = app(h.engine.clone(), LIMIT);

    let session_id = new_session(&router, json!({ "scope": "cv" })).await;
    let (status, json) = send_json(
        &router,
        upload_request(&session_id, multipart_body("Résumé.pdf", PDF, &[])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["file_name"], "Résumé.pdf");
    assert_eq!(json["file_size"], PDF.len());
    assert_eq!(h.staged_files().len(), 1);

    let (_, json) = send_json(
        &router,
        Request::get(format!("/sessions/{}", session_id)).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(json["field_name"], "attachments-cv");
    assert_eq!(json["uploads"].as_array().unwrap().len(), 1);

    let (status, json) = send_json(
        &router,
        json_request(
            "POST",
            &format!("/sessions/{}/attach", session_id),
            json!({ "owner_type": "hr.candidate", "owner_id": "12" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    let attachment_id = json["attachments"][0]["id"].as_i64().unwrap();
    assert_eq!(json["attachments"][0]["storage_path"], "hr/candidate/12/cv/Résumé.pdf");

    let (status, headers, body) = send(
        &router,
        Request::get(format!("/attachments/{}/download", attachment_id))
            .header(USER_HEADER, "bob")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, PDF);
    assert_eq!(headers[header::CONTENT_TYPE], "application/pdf");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"R%C3%A9sum%C3%A9.pdf\""
    );

    let (status, json) = send_json(
        &router,
        Request::get(format!("/attachments/{}/download", attachment_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["ok"], false);

    let (_, json) = send_json(
        &router,
        Request::get("/owners/hr.candidate/12/attachments")
            .header(USER_HEADER, "bob")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(json["attachments"].as_array().unwrap().len(), 1);

    let (status, _) = send_json(
        &router,
        json_request(
            "POST",
            &format!("/sessions/{}/attach", session_id),
            json!({ "owner_type": "hr.candidate", "owner_id": "12" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn owner_listings_hide_attachments_from_anonymous_callers() {
    let h = Harness::new().await;
    let router = app(h.engine.clone(), LIMIT);
    let session_id = new_session(&router, json!({})).await;
    send_json(
        &router,
        upload_request(&session_id, multipart_body("a.pdf", PDF, &[])),
    )
    .await;
    let (status, _) = send_json(
        &router,
        json_request(
            "POST",
            &format!("/sessions/{}/attach", session_id),
            json!({ "owner_type": "crm.deal", "owner_id": "9" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let list = |user: Option<&str>| {
        let mut request = Request::get("/owners/crm.deal/9/attachments");
        if let Some(user) = user {
            request = request.header(USER_HEADER, user);
        }
        request.body(Body::empty()).unwrap()
    };
    let (status, json) = send_json(&router, list(None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["attachments"].as_array().unwrap().is_empty());

    let (_, json) = send_json(&router, list(Some("carol"))).await;
    let attachments = json["attachments"].as_array().unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0]["original_filename"], "a.pdf");
}

#[tokio::test]
async fn unknown_sessions_leave_no_spooled_upload() {
    let h = Harness::new().await;
    let router = app(h.engine.clone(), LIMIT);
    let (status, _) = send_json(
        &router,
        upload_request(
            "ffffffffffffffffffffffffffffffff",
            multipart_body("a.pdf", PDF, &[]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.staged_files().is_empty());
}

#[tokio::test]
async fn iframe_uploads_get_plain_text_responses() {
    let h = Harness::new().await;
    let router = app(h.engine.clone(), LIMIT);
    let session_id = new_session(&router, json!({})).await;

    let body = multipart_body("notes.txt", b"hello", &[("X-Requested-With", "IFrame")]);
    let (status, headers, body) = send(&router, upload_request(&session_id, body)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
}

#[tokio::test]
async fn rejected_uploads_still_answer_ok() {
    let h = Harness::new().await;
    let router = app(h.engine.clone(), LIMIT);
    let session_id = new_session(&router, json!({ "allowed_extensions": "pdf" })).await;

    let (status, json) = send_json(
        &router,
        upload_request(&session_id, multipart_body("run.exe", b"MZ\x90\x00", &[])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], false);
    assert_eq!(
        json["error"],
        "run.exe is not an allowed file type. Allowed extensions: .pdf"
    );

    let (status, json) = send_json(
        &router,
        upload_request(
            "ffffffffffffffffffffffffffffffff",
            multipart_body("a.pdf", PDF, &[]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["ok"], false);
}

#[tokio::test]
async fn missing_properties_block_attach() {
    let h = Harness::new().await;
    let schema = StaticPropertySchema::new(vec![PropertyDefinition {
        slug: "title".into(),
        label: "Title".into(),
        data_type: DataKind::String,
        required: true,
        choices: vec![],
        target_kinds: vec!["crm.deal".into()],
    }]);
    let router = app(h.engine.clone().with_schema(Arc::new(schema)), LIMIT);
    let session_id = new_session(&router, json!({ "target_kind": "crm.deal" })).await;

    let (_, json) = send_json(
        &router,
        upload_request(&session_id, multipart_body("a.txt", b"one", &[])),
    )
    .await;
    assert_eq!(json["ok"], true);
    let (_, json) = send_json(
        &router,
        Request::get(format!("/sessions/{}", session_id)).body(Body::empty()).unwrap(),
    )
    .await;
    let upload_id = json["uploads"][0]["id"].as_i64().unwrap();
    let key = format!("upload-{}-title", upload_id);

    let attach_uri = format!("/sessions/{}/attach", session_id);
    let (status, json) = send_json(
        &router,
        json_request(
            "POST",
            &attach_uri,
            json!({ "owner_type": "crm.deal", "owner_id": "3" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], false);
    assert_eq!(json["field_errors"][&key][0], "This field is required.");

    let mut metadata = serde_json::Map::new();
    metadata.insert(key.clone(), json!("Offer"));
    let (status, json) = send_json(
        &router,
        json_request(
            "POST",
            &attach_uri,
            json!({ "owner_type": "crm.deal", "owner_id": "3", "metadata": metadata }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["attachments"][0]["properties"]["title"][0], "Offer");
}
