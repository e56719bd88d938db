//! HTTP surface of the question-answering service.

use crate::VqaModel;
use crate::messages::{ErrorResponse, PredictRequest, PredictResponse};
use crate::service::{ImageSource, Prediction, VqaService};
use axum::{
    Form, Json, Router,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;

/// The fields a prediction request may carry, however it was encoded.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PredictInput {
    pub question: Option<String>,
    pub image_url: Option<String>,
    pub image: Option<Vec<u8>>,
}

impl From<Prediction> for PredictResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            answer: prediction.answer,
            info: prediction.info,
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn read_multipart(request: Request) -> Result<PredictInput, Response> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(IntoResponse::into_response)?;

    let mut input = PredictInput::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(IntoResponse::into_response)?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("question") => {
                input.question = Some(field.text().await.map_err(IntoResponse::into_response)?)
            }
            Some("image_url") => {
                input.image_url = Some(field.text().await.map_err(IntoResponse::into_response)?)
            }
            Some("image") => {
                let bytes = field.bytes().await.map_err(IntoResponse::into_response)?;
                input.image = Some(bytes.to_vec());
            }
            _ => {}
        }
    }
    Ok(input)
}

/// Reads a JSON, URL-encoded or multipart body. Any other body carries no
/// fields.
pub async fn read_input(request: Request) -> Result<PredictInput, Response> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        let Json(body) = Json::<PredictRequest>::from_request(request, &())
            .await
            .map_err(IntoResponse::into_response)?;
        Ok(PredictInput {
            question: body.question,
            image_url: body.image_url,
            image: None,
        })
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(body) = Form::<PredictRequest>::from_request(request, &())
            .await
            .map_err(IntoResponse::into_response)?;
        Ok(PredictInput {
            question: body.question,
            image_url: body.image_url,
            image: None,
        })
    } else if content_type.starts_with("multipart/form-data") {
        read_multipart(request).await
    } else {
        Ok(PredictInput::default())
    }
}

async fn predict<M>(State(service): State<Arc<VqaService<M>>>, request: Request) -> Response
where
    M: VqaModel + Send + Sync + 'static,
{
    let input = match read_input(request).await {
        Ok(input) => input,
        Err(rejection) => return rejection,
    };

    let Some(source) = ImageSource::select(input.image_url, input.image) else {
        return error_response(StatusCode::BAD_REQUEST, "No image provided");
    };
    let Some(question) = input.question else {
        return error_response(StatusCode::BAD_REQUEST, "No question provided");
    };

    match tokio::task::spawn_blocking(move || service.predict(source, &question)).await {
        Ok(Ok(prediction)) => (StatusCode::OK, Json(PredictResponse::from(prediction))).into_response(),
        Ok(Err(e)) => {
            log::error!("Prediction failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            log::error!("Prediction worker failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Prediction worker failed")
        }
    }
}

async fn preflight() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
        ],
    )
}

async fn allow_any_origin(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

/// Builds the application router around a loaded service.
pub fn router<M>(service: Arc<VqaService<M>>) -> Router
where
    M: VqaModel + Send + Sync + 'static,
{
    Router::new()
        .route("/", get(|| async { "Welcome to the bird VQA service!" }))
        .route(
            "/predict",
            post(predict::<M>)
                .options(preflight)
                .layer(DefaultBodyLimit::disable()),
        )
        .layer(middleware::map_response(allow_any_origin))
        .with_state(service)
}
