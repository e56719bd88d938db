//! Visual question answering over bird images.
//!
//! The crate exposes two halves that share one pretrained ViLT network:
//! an inference service (see [`service`] and [`server`]) that answers a
//! question about an image and enriches the answer with an encyclopedia
//! summary, and a fine-tuning pipeline (see [`dataset`] and [`trainer`])
//! that adapts the network's classifier to a bird-species label set.

pub mod checkpoint;
pub mod dataset;
pub mod knowledge;
pub mod messages;
pub mod pipeline;
pub mod processor;
pub mod server;
pub mod service;
pub mod trainer;
pub mod vilt;

use image::RgbImage;

/// A single question about a decoded image.
pub struct VqaRequest {
    /// The image, already converted to three 8-bit channels.
    pub image: RgbImage,
    /// The natural-language question.
    pub question: String,
}

/// The model's answer to a [`VqaRequest`].
#[derive(Clone, Debug, PartialEq)]
pub struct VqaAnswer {
    /// Index of the highest logit.
    pub index: usize,
    /// Human-readable label for `index`, taken from the label vocabulary.
    pub label: String,
    /// Raw logit of the selected class.
    pub score: f32,
}

/// Trait for implementing question-answering models used by the service.
///
/// Implementations must be usable from several request handlers at once, so
/// inference takes `&self`. A model is loaded once at startup and never
/// mutated while serving.
pub trait VqaModel {
    /// The error type that can be returned during inference.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs inference on the given request and returns the selected answer.
    fn answer(&self, request: &VqaRequest) -> Result<VqaAnswer, Self::Error>;
}

pub use checkpoint::{CheckpointError, ModelFiles};
pub use dataset::{BirdSamples, DatasetError, LoadedDataset, ManifestEntry, Sample};
pub use knowledge::{KnowledgeBase, KnowledgeError, Wikipedia};
pub use pipeline::{PipelineError, VqaPipeline};
pub use processor::{EncodedBatch, Encoding, ProcessorError, ViltProcessor};
pub use service::{ImageSource, Prediction, ServiceError, VqaService};
pub use trainer::{BirdDataset, Dataset, TrainError, Trainer, TrainingArgs};
pub use vilt::{LabelVocabulary, ViltConfig, ViltForQuestionAnswering};
