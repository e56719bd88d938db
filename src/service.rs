//! Answering one question about one image, end to end.
//!
//! A request names its image either by URL or by uploaded bytes. The image
//! is decoded, the model picks an answer, and the answer is looked up in a
//! [`KnowledgeBase`] for a short summary. An ambiguous lookup degrades into
//! a descriptive string instead of failing the request.

use crate::knowledge::{KnowledgeBase, KnowledgeError};
use crate::processor::{self, ProcessorError};
use crate::{VqaModel, VqaRequest};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Appended to the predicted label before the summary lookup.
pub const TOPIC_SUFFIX: &str = " (animal)";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to fetch image: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("failed to decode image: {0}")]
    Decode(#[from] ProcessorError),

    #[error("model inference failed: {0}")]
    Model(Box<dyn std::error::Error + Send + Sync>),

    #[error("knowledge lookup failed: {0}")]
    Knowledge(KnowledgeError),
}

/// Where the image of a request comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    Upload(Vec<u8>),
}

impl ImageSource {
    /// Picks the image source of a request. The URL wins when both are
    /// present; empty values count as absent.
    pub fn select(image_url: Option<String>, upload: Option<Vec<u8>>) -> Option<Self> {
        match (image_url, upload) {
            (Some(url), _) if !url.is_empty() => Some(ImageSource::Url(url)),
            (_, Some(bytes)) if !bytes.is_empty() => Some(ImageSource::Upload(bytes)),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            ImageSource::Url(url) => format!("url {url}"),
            ImageSource::Upload(bytes) => format!("upload of {} bytes", bytes.len()),
        }
    }
}

/// Retrieves image bytes by URL.
pub trait ImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError>;
}

/// Blocking HTTP fetcher without timeout, retry or size limit.
pub struct HttpImageFetcher {
    client: reqwest::blocking::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Result<Self, ServiceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self { client })
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        let bytes = self.client.get(url).send()?.error_for_status()?.bytes()?;
        Ok(bytes.to_vec())
    }
}

/// Quotes a title the way a Python string literal is printed: single quotes
/// unless the title holds a single quote and no double quote.
fn quote_title(title: &str) -> String {
    let quote = if title.contains('\'') && !title.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(title.len() + 2);
    out.push(quote);
    for c in title.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Renders an ambiguous lookup the way the service reports it.
pub fn describe_disambiguation(options: &[String]) -> String {
    let quoted: Vec<String> = options.iter().map(|o| quote_title(o)).collect();
    format!("Disambiguation error: [{}]", quoted.join(", "))
}

/// Answer plus encyclopedia summary for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prediction {
    pub answer: String,
    pub info: String,
}

/// Shared, read-only state behind the prediction endpoint.
pub struct VqaService<M: VqaModel> {
    model: M,
    knowledge: Box<dyn KnowledgeBase + Send + Sync>,
    fetcher: Box<dyn ImageFetcher + Send + Sync>,
    request_counter: AtomicU64,
}

impl<M: VqaModel> VqaService<M> {
    pub fn new(
        model: M,
        knowledge: Box<dyn KnowledgeBase + Send + Sync>,
        fetcher: Box<dyn ImageFetcher + Send + Sync>,
    ) -> Self {
        Self {
            model,
            knowledge,
            fetcher,
            request_counter: AtomicU64::new(0),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn acquire_image(&self, source: &ImageSource) -> Result<RgbImage, ServiceError> {
        let image = match source {
            ImageSource::Url(url) => processor::decode_image(&self.fetcher.fetch(url)?)?,
            ImageSource::Upload(bytes) => processor::decode_image(bytes)?,
        };
        Ok(image)
    }

    fn lookup(&self, label: &str) -> Result<String, ServiceError> {
        match self.knowledge.summary(&format!("{label}{TOPIC_SUFFIX}")) {
            Ok(summary) => Ok(summary),
            Err(KnowledgeError::Disambiguation { options, .. }) => {
                Ok(describe_disambiguation(&options))
            }
            Err(e) => Err(ServiceError::Knowledge(e)),
        }
    }

    /// Answers `question` about the image from `source`. Blocks on network
    /// and model work.
    pub fn predict(&self, source: ImageSource, question: &str) -> Result<Prediction, ServiceError> {
        let id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        let start_time = Instant::now();
        log::debug!("[{id}] acquiring image from {}", source.describe());

        let image = self.acquire_image(&source)?;
        let answer = self
            .model
            .answer(&VqaRequest {
                image,
                question: question.to_string(),
            })
            .map_err(|e| ServiceError::Model(Box::new(e)))?;
        log::debug!("[{id}] model answered '{}'", answer.label);

        let info = self.lookup(&answer.label)?;
        log::info!(
            "[{id}] '{question}' -> '{}' in {:?}",
            answer.label,
            start_time.elapsed()
        );

        Ok(Prediction {
            answer: answer.label,
            info,
        })
    }
}
