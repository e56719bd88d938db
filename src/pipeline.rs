use crate::processor::{ProcessorError, ViltProcessor};
use crate::vilt::ViltForQuestionAnswering;
use crate::{VqaAnswer, VqaModel, VqaRequest};
use candle_core::{Device, IndexOp};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("model produced no logits")]
    NoLogits,

    #[error("class index {0} is outside the label vocabulary")]
    UnknownLabel(usize),
}

/// Index and value of the largest logit.
pub fn top_class(logits: &[f32]) -> Option<(usize, f32)> {
    logits
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}

/// A processor and network pair answering one question at a time.
pub struct VqaPipeline {
    model: ViltForQuestionAnswering,
    processor: ViltProcessor,
    device: Device,
}

impl VqaPipeline {
    pub fn new(model: ViltForQuestionAnswering, processor: ViltProcessor, device: Device) -> Self {
        Self {
            model,
            processor,
            device,
        }
    }

    pub fn model(&self) -> &ViltForQuestionAnswering {
        &self.model
    }
}

impl VqaModel for VqaPipeline {
    type Error = PipelineError;

    fn answer(&self, request: &VqaRequest) -> Result<VqaAnswer, Self::Error> {
        let encoding = self.processor.encode(&request.image, &request.question)?;
        let batch = self.processor.collate(&[encoding], &self.device)?;
        let logits: Vec<f32> = self.model.forward(&batch)?.i(0)?.to_vec1()?;

        let (index, score) = top_class(&logits).ok_or(PipelineError::NoLogits)?;
        let label = self
            .model
            .labels()
            .get(index)
            .ok_or(PipelineError::UnknownLabel(index))?
            .to_string();
        log::debug!("'{}' -> {label} ({score:.3})", request.question);

        Ok(VqaAnswer {
            index,
            label,
            score,
        })
    }
}
