use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use std::io::Cursor;
use std::sync::Arc;
use vqa_birds::{
    VqaAnswer, VqaModel, VqaRequest,
    knowledge::{KnowledgeBase, KnowledgeError},
    server,
    service::{ImageFetcher, ServiceError, VqaService},
};

const GOOD_URL: &str = "http://images.test/bird.png";

fn png_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(6, 4, Rgb([10, 20, 30]));
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buffer, ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}

/// Answers with the question text, so tests can steer the label.
struct EchoModel;

impl VqaModel for EchoModel {
    type Error = std::io::Error;

    fn answer(&self, request: &VqaRequest) -> Result<VqaAnswer, Self::Error> {
        assert_eq!(request.image.dimensions(), (6, 4));
        Ok(VqaAnswer {
            index: 0,
            label: request.question.clone(),
            score: 1.0,
        })
    }
}

struct StubKnowledge;

impl KnowledgeBase for StubKnowledge {
    fn summary(&self, topic: &str) -> Result<String, KnowledgeError> {
        match topic {
            "Blue jay (animal)" => Ok("The blue jay is a passerine bird.".to_string()),
            "Crane (animal)" => Err(KnowledgeError::Disambiguation {
                title: "Crane".to_string(),
                options: vec!["Crane (bird)".to_string(), "Crane (machine)".to_string()],
            }),
            other => Err(KnowledgeError::PageNotFound(other.to_string())),
        }
    }
}

struct StubFetcher;

impl ImageFetcher for StubFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        if url == GOOD_URL {
            Ok(png_bytes())
        } else {
            Ok(b"<html>not an image</html>".to_vec())
        }
    }
}

async fn spawn_server() -> String {
    let service = Arc::new(VqaService::new(
        EchoModel,
        Box::new(StubKnowledge),
        Box::new(StubFetcher),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(service)).await.unwrap();
    });
    format!("http://{addr}")
}

async fn post_json(base: &str, body: Value) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(format!("{base}/predict"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

async fn post_form(base: &str, form: Form) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(format!("{base}/predict"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn missing_image_is_a_client_error() {
    let base = spawn_server().await;

    let (status, body) = post_json(&base, json!({ "question": "Which bird?" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "No image provided" }));

    let form = Form::new().text("question", "Which bird?");
    let (status, body) = post_form(&base, form).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "No image provided" }));
}

#[tokio::test]
async fn body_without_content_type_has_no_image() {
    let base = spawn_server().await;
    let response = reqwest::Client::new()
        .post(format!("{base}/predict"))
        .body("question=hi")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No image provided");
}

#[tokio::test]
async fn missing_question_is_a_client_error() {
    let base = spawn_server().await;
    let (status, body) = post_json(&base, json!({ "image_url": GOOD_URL })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No question provided");
}

#[tokio::test]
async fn uploaded_image_is_answered_with_summary() {
    let base = spawn_server().await;
    let form = Form::new()
        .text("question", "Blue jay")
        .part("image", Part::bytes(png_bytes()).file_name("bird.png"));
    let (status, body) = post_form(&base, form).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "answer": "Blue jay", "info": "The blue jay is a passerine bird." })
    );
}

#[tokio::test]
async fn image_url_is_answered_with_string_fields() {
    let base = spawn_server().await;
    let (status, body) = post_json(
        &base,
        json!({ "image_url": GOOD_URL, "question": "Blue jay" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["answer"].is_string());
    assert!(body["info"].is_string());
}

#[tokio::test]
async fn url_wins_over_upload() {
    let base = spawn_server().await;
    let form = Form::new()
        .text("question", "Blue jay")
        .text("image_url", GOOD_URL)
        .part("image", Part::bytes(b"garbage".to_vec()).file_name("x.png"));
    let (status, body) = post_form(&base, form).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], "Blue jay");
}

#[tokio::test]
async fn ambiguous_lookup_is_reported_in_info() {
    let base = spawn_server().await;
    let (status, body) =
        post_json(&base, json!({ "image_url": GOOD_URL, "question": "Crane" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], "Crane");
    let info = body["info"].as_str().unwrap();
    assert!(info.starts_with("Disambiguation error:"));
    assert!(info.contains("Crane (bird)"));
    assert!(info.contains("Crane (machine)"));
}

#[tokio::test]
async fn failed_lookup_is_a_server_error() {
    let base = spawn_server().await;
    let (status, body) =
        post_json(&base, json!({ "image_url": GOOD_URL, "question": "Dodo" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("Dodo (animal)"));
}

#[tokio::test]
async fn undecodable_image_is_a_server_error() {
    let base = spawn_server().await;
    let (status, _) = post_json(
        &base,
        json!({ "image_url": "http://images.test/page.html", "question": "Blue jay" }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let form = Form::new()
        .text("question", "Blue jay")
        .part("image", Part::bytes(b"garbage".to_vec()).file_name("x.png"));
    let (status, _) = post_form(&base, form).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn cross_origin_requests_are_allowed() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let preflight = client
        .request(reqwest::Method::OPTIONS, format!("{base}/predict"))
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
    assert_eq!(preflight.headers()["access-control-allow-origin"], "*");

    let (status, _) = post_json(&base, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let response = client.get(&base).send().await.unwrap();
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert!(response.text().await.unwrap().starts_with("Welcome"));
}

#[tokio::test]
async fn url_encoded_form_is_accepted() {
    let base = spawn_server().await;
    let response = reqwest::Client::new()
        .post(format!("{base}/predict"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("image_url=http%3A%2F%2Fimages.test%2Fbird.png&question=Blue+jay")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["answer"], "Blue jay");
    assert_eq!(body["info"], "The blue jay is a passerine bird.");
}

#[tokio::test]
async fn large_uploads_are_not_capped() {
    let base = spawn_server().await;
    let padding = "x".repeat(3 * 1024 * 1024);
    let form = Form::new()
        .text("question", "Blue jay")
        .text("notes", padding)
        .part("image", Part::bytes(png_bytes()).file_name("bird.png"));
    let (status, body) = post_form(&base, form).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], "Blue jay");
}
