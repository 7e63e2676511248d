use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use batchpdf::{EngineOutput, FileRef, JobFailure, OperationEngine, OperationRequest};
use batchpdf_api::{app, sweep_expired, AppState, Registry, ServerConfig};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "----WebKitFormBoundary7MA4YWxkTrZu0gW";

/// Engine driven by file contents: `BROKEN` is refused, `SLOW` never finishes
struct ScriptedEngine {
    output_dir: PathBuf,
}

impl OperationEngine for ScriptedEngine {
    async fn process(
        &self,
        file: &FileRef,
        _request: &OperationRequest,
    ) -> Result<EngineOutput, JobFailure> {
        let input = tokio::fs::read(file.as_path())
            .await
            .map_err(|e| JobFailure::Engine(e.to_string()))?;

        if input.starts_with(b"BROKEN") {
            return Err(JobFailure::Validation("not a PDF".to_string()));
        }
        if input.starts_with(b"SLOW") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let output = self.output_dir.join(format!("{}.pdf", uuid::Uuid::new_v4()));
        let body = &input[..input.len() / 2];
        tokio::fs::write(&output, body)
            .await
            .map_err(|e| JobFailure::Engine(e.to_string()))?;

        Ok(EngineOutput {
            output_ref: FileRef::from(output),
            output_size_bytes: body.len() as u64,
        })
    }
}

struct TestServer {
    app: Router,
    runs: Registry,
    _dir: TempDir,
}

fn server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let output_dir = dir.path().join("outputs");
    std::fs::create_dir_all(&output_dir).unwrap();

    let config = ServerConfig {
        max_upload_bytes: 1024,
        workers: 2,
        storage_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let state = AppState::new(ScriptedEngine { output_dir }, config);
    let runs = state.runs();

    TestServer {
        app: app(state),
        runs,
        _dir: dir,
    }
}

enum Part<'a> {
    File(&'a str, &'a str, &'a [u8]),
    /// File part with an explicit content type
    Typed(&'a str, &'a str, &'a str, &'a [u8]),
    Text(&'a str, &'a str),
}

fn file_part(body: &mut Vec<u8>, field: &str, name: &str, content_type: &str, data: &[u8]) {
    write!(
        body,
        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
        field, name
    )
    .unwrap();
    write!(body, "Content-Type: {}\r\n\r\n", content_type).unwrap();
    body.extend_from_slice(data);
}

/// A document with `pages` empty pages
fn pdf_with_pages(pages: u32) -> Vec<u8> {
    use lopdf::{dictionary, Document, Object};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let media_box: Vec<Object> = [0, 0, 612, 792].into_iter().map(Object::Integer).collect();
    let kids: Vec<Object> = (0..pages)
        .map(|_| {
            Object::Reference(doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => media_box.clone(),
            }))
        })
        .collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

fn multipart(uri: &str, parts: &[Part]) -> Request<Body> {
    let mut body = Vec::new();

    for part in parts {
        write!(body, "--{}\r\n", BOUNDARY).unwrap();
        match part {
            Part::File(field, name, data) => {
                let content_type = if name.ends_with(".pdf") {
                    "application/pdf"
                } else {
                    "text/plain"
                };
                file_part(&mut body, field, name, content_type, data);
            }
            Part::Typed(field, name, content_type, data) => {
                file_part(&mut body, field, name, content_type, data);
            }
            Part::Text(field, value) => {
                write!(
                    body,
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}",
                    field, value
                )
                .unwrap();
            }
        }
        write!(body, "\r\n").unwrap();
    }
    write!(body, "--{}--\r\n", BOUNDARY).unwrap();

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn compress() -> String {
    json!({ "operation": "compress", "quality": "medium" }).to_string()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn wait_until_terminal(app: &Router, batch_id: &str) -> Value {
    for _ in 0..500 {
        let (status, body) = send_json(app, get(&format!("/api/batch/{batch_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        if body["terminal"] == true {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {batch_id} did not finish");
}

#[tokio::test]
async fn test_health_check() {
    let server = server();
    let (status, body) = send_json(&server.app, get("/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_validate_accepts_pdf() {
    let server = server();
    let request = multipart(
        "/api/validate",
        &[Part::File("file", "report.pdf", b"%PDF-1.4 small")],
    );

    let (status, body) = send_json(&server.app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["file"]["name"], "report.pdf");
    assert_eq!(body["file"]["size_bytes"], 14);
}

#[tokio::test]
async fn test_validate_rejects_oversize_file_with_details() {
    let server = server();
    let data = vec![b'x'; 2048];
    let request = multipart("/api/validate", &[Part::File("file", "big.pdf", &data)]);

    let (status, body) = send_json(&server.app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "File size 2 KB exceeds the maximum allowed size of 1 KB"
    );
    assert_eq!(body["details"]["providedSize"], 2048);
    assert_eq!(body["details"]["maxSize"], 1024);
    assert_eq!(body["details"]["providedSizeFormatted"], "2 KB");
    assert_eq!(body["details"]["maxSizeFormatted"], "1 KB");
}

#[tokio::test]
async fn test_validate_rejects_wrong_type_for_operation() {
    let server = server();
    let request = multipart(
        "/api/validate",
        &[
            Part::Text("operation", "compress"),
            Part::File("file", "notes.txt", b"hello"),
        ],
    );

    let (status, body) = send_json(&server.app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid file type: notes.txt"));
    assert!(body.get("details").is_none());
}

#[tokio::test]
async fn test_validate_without_file() {
    let server = server();
    let request = multipart("/api/validate", &[Part::Text("operation", "compress")]);

    let (status, body) = send_json(&server.app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No file provided");
}

#[tokio::test]
async fn test_validate_counts_pages_of_pdf_named_without_extension() {
    let server = server();
    let document = pdf_with_pages(3);
    let request = multipart(
        "/api/validate",
        &[Part::Typed("file", "upload", "application/pdf", &document)],
    );

    let (status, body) = send_json(&server.app, request).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["file"]["name"], "upload");
    assert_eq!(body["file"]["page_count"], 3);
}

#[tokio::test]
async fn test_validate_reads_operation_after_file() {
    let server = server();
    let request = multipart(
        "/api/validate",
        &[
            Part::File("file", "scan.png", b"png bytes"),
            Part::Text("operation", "compress"),
        ],
    );
    let (status, body) = send_json(&server.app, request).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let request = multipart(
        "/api/validate",
        &[
            Part::File("file", "report.pdf", b"%PDF-1.4"),
            Part::Text("operation", "shrink"),
        ],
    );
    let (status, body) = send_json(&server.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Unknown operation: shrink");
}

#[tokio::test]
async fn test_validate_truncated_form_is_extraction_failure() {
    let server = server();
    // File part with no closing boundary
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"cut.pdf\"\r\n\
         Content-Type: application/pdf\r\n\r\n\
         %PDF-1.4 cut short"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/api/validate")
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap();

    let (status, body) = send_json(&server.app, request).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to parse form data");
    assert!(body["details"].as_str().is_some_and(|d| !d.is_empty()));
}

#[tokio::test]
async fn test_batch_runs_to_completion_with_partial_failure() {
    let server = server();
    let parameters = compress();
    let request = multipart(
        "/api/batch",
        &[
            Part::Text("parameters", &parameters),
            Part::File("files", "a.pdf", b"%PDF-aaaaaaaa"),
            Part::File("files", "b.pdf", b"BROKEN-bbbbbb"),
            Part::File("files", "c.pdf", b"%PDF-cccccccc"),
        ],
    );

    let (status, body) = send_json(&server.app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["operation"], "compress");
    assert_eq!(body["jobs"].as_array().unwrap().len(), 3);
    assert!(body["rejected"].as_array().unwrap().is_empty());

    let batch_id = body["batch_id"].as_str().unwrap().to_string();
    let status = wait_until_terminal(&server.app, &batch_id).await;

    assert_eq!(status["progress"]["completed"], 2);
    assert_eq!(status["progress"]["failed"], 1);
    assert_eq!(status["statistics"]["completed_count"], 2);
    assert_eq!(status["statistics"]["failed_count"], 1);
    assert_eq!(status["statistics"]["total_original_bytes"], 26);
    assert_eq!(status["statistics"]["total_result_bytes"], 12);

    let failed: Vec<&Value> = status["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|job| job["state"] == "failed")
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["file"]["name"], "b.pdf");
    assert_eq!(failed[0]["failure"]["kind"], "validation");
}

#[tokio::test]
async fn test_bundle_contains_completed_outputs() {
    let server = server();
    let parameters = compress();
    let request = multipart(
        "/api/batch",
        &[
            Part::Text("parameters", &parameters),
            Part::File("files", "a.pdf", b"%PDF-aaaaaaaa"),
            Part::File("files", "b.pdf", b"BROKEN-bbbbbb"),
        ],
    );
    let (_, body) = send_json(&server.app, request).await;
    let batch_id = body["batch_id"].as_str().unwrap().to_string();
    wait_until_terminal(&server.app, &batch_id).await;

    let response = server
        .app
        .clone()
        .oneshot(get(&format!("/api/batch/{batch_id}/bundle")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/zip");
    assert!(response.headers().contains_key("x-batch-warnings"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
    assert_eq!(archive.len(), 2);

    let mut contents = String::new();
    archive
        .by_name("a.pdf")
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "%PDF-a");
    assert!(archive.by_name("manifest.json").is_ok());
}

#[tokio::test]
async fn test_batch_without_parameters_is_bad_request() {
    let server = server();
    let request = multipart(
        "/api/batch",
        &[Part::File("files", "a.pdf", b"%PDF-aaaaaaaa")],
    );

    let (status, body) = send_json(&server.app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing parameters field");
}

#[tokio::test]
async fn test_batch_with_invalid_parameters() {
    let server = server();
    let parameters = json!({ "operation": "rotate", "angle": 45 }).to_string();
    let request = multipart(
        "/api/batch",
        &[
            Part::Text("parameters", &parameters),
            Part::File("files", "a.pdf", b"%PDF-aaaaaaaa"),
        ],
    );

    let (status, _) = send_json(&server.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_reports_rejected_files() {
    let server = server();
    let parameters = compress();
    let oversize = vec![b'x'; 4096];
    let request = multipart(
        "/api/batch",
        &[
            Part::Text("parameters", &parameters),
            Part::File("files", "a.pdf", b"%PDF-aaaaaaaa"),
            Part::File("files", "huge.pdf", &oversize),
            Part::File("files", "notes.txt", b"hello"),
        ],
    );

    let (status, body) = send_json(&server.app, request).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

    let rejected = body["rejected"].as_array().unwrap();
    assert_eq!(rejected.len(), 2);
    assert_eq!(rejected[0]["file_name"], "huge.pdf");
    assert_eq!(rejected[0]["details"]["providedSize"], 4096);
    assert_eq!(rejected[1]["file_name"], "notes.txt");
}

#[tokio::test]
async fn test_batch_with_only_rejected_files() {
    let server = server();
    let parameters = json!({ "operation": "rotate", "angle": 90, "pages": "1-2" }).to_string();
    let request = multipart(
        "/api/batch",
        &[
            Part::Text("parameters", &parameters),
            Part::File("files", "a.pdf", b"not really a pdf"),
        ],
    );

    let (status, body) = send_json(&server.app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Could not determine the page count of a.pdf");
}

#[tokio::test]
async fn test_unknown_batch_is_not_found() {
    let server = server();
    let id = uuid::Uuid::new_v4();

    let (status, body) = send_json(&server.app, get(&format!("/api/batch/{id}"))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], format!("Batch {id} not found"));
}

#[tokio::test]
async fn test_cancel_running_batch() {
    let server = server();
    let parameters = compress();
    let request = multipart(
        "/api/batch",
        &[
            Part::Text("scheduling", "sequential"),
            Part::Text("parameters", &parameters),
            Part::File("files", "slow.pdf", b"SLOW-sssssss"),
            Part::File("files", "b.pdf", b"%PDF-bbbbbbbb"),
        ],
    );
    let (_, body) = send_json(&server.app, request).await;
    assert_eq!(body["scheduling"], "sequential");
    let batch_id = body["batch_id"].as_str().unwrap().to_string();

    let (status, _) = send(&server.app, get(&format!("/api/batch/{batch_id}/bundle"))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) =
        send_json(&server.app, post(&format!("/api/batch/{batch_id}/cancel"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled_jobs"], 2);

    let status = wait_until_terminal(&server.app, &batch_id).await;
    assert_eq!(status["cancelled"], true);
    assert_eq!(status["progress"]["failed"], 2);
    assert!(status["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .all(|job| job["failure"]["kind"] == "cancelled"));
}

#[tokio::test]
async fn test_retry_failed_jobs() {
    let server = server();
    let parameters = compress();
    let request = multipart(
        "/api/batch",
        &[
            Part::Text("parameters", &parameters),
            Part::File("files", "a.pdf", b"%PDF-aaaaaaaa"),
            Part::File("files", "b.pdf", b"BROKEN-bbbbbb"),
        ],
    );
    let (_, body) = send_json(&server.app, request).await;
    let batch_id = body["batch_id"].as_str().unwrap().to_string();
    wait_until_terminal(&server.app, &batch_id).await;

    let (status, body) =
        send_json(&server.app, post(&format!("/api/batch/{batch_id}/retry"))).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_ne!(body["batch_id"].as_str().unwrap(), batch_id);
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["file_name"], "b.pdf");

    // The retried upload is still on disk
    let retry_id = body["batch_id"].as_str().unwrap().to_string();
    let status = wait_until_terminal(&server.app, &retry_id).await;
    assert_eq!(status["jobs"][0]["failure"]["kind"], "validation");
}

#[tokio::test]
async fn test_retry_without_failures_is_conflict() {
    let server = server();
    let parameters = compress();
    let request = multipart(
        "/api/batch",
        &[
            Part::Text("parameters", &parameters),
            Part::File("files", "a.pdf", b"%PDF-aaaaaaaa"),
        ],
    );
    let (_, body) = send_json(&server.app, request).await;
    let batch_id = body["batch_id"].as_str().unwrap().to_string();
    wait_until_terminal(&server.app, &batch_id).await;

    let (status, body) =
        send_json(&server.app, post(&format!("/api/batch/{batch_id}/retry"))).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], format!("Batch {batch_id} has no failed jobs"));
}

#[tokio::test]
async fn test_sweep_forgets_expired_batches() {
    let server = server();
    let parameters = compress();
    let request = multipart(
        "/api/batch",
        &[
            Part::Text("parameters", &parameters),
            Part::File("files", "slow.pdf", b"SLOW-sssssss"),
        ],
    );
    let (_, body) = send_json(&server.app, request).await;
    let batch_id = body["batch_id"].as_str().unwrap().to_string();

    let handle = {
        let runs = server.runs.read().await;
        assert_eq!(runs.len(), 1);
        runs.values().next().unwrap().handle.clone()
    };

    // A day-long window keeps the fresh run
    assert_eq!(sweep_expired(&server.runs, Duration::from_secs(86_400)).await, 0);
    let (status, _) = send(&server.app, get(&format!("/api/batch/{batch_id}"))).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(sweep_expired(&server.runs, Duration::ZERO).await, 1);
    assert!(handle.is_cancelled());
    assert!(handle.is_terminal());

    let (status, _) = send(&server.app, get(&format!("/api/batch/{batch_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
