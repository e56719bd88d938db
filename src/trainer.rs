//! Fine-tuning loop for [`ViltForQuestionAnswering`].
//!
//! The loop owns batching, per-epoch shuffling of the training set, AdamW
//! optimization, periodic loss logging and end-of-epoch evaluation. Samples
//! come from any [`Dataset`]; [`BirdDataset`] reads and encodes images on
//! every access, without caching.

use crate::dataset::BirdSamples;
use crate::processor::{self, EncodedBatch, Encoding, ProcessorError, ViltProcessor};
use crate::vilt::ViltForQuestionAnswering;
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap, loss::cross_entropy};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::path::PathBuf;

pub const DEFAULT_OUTPUT_DIR: &str = "./vilt-finetuned-birds";
pub const DEFAULT_LEARNING_RATE: f64 = 2e-5;
pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const DEFAULT_EPOCHS: usize = 3;
pub const DEFAULT_WEIGHT_DECAY: f64 = 0.01;
pub const DEFAULT_LOGGING_STEPS: usize = 10;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("failed to prepare sample {index} ({path}): {source}")]
    Sample {
        index: usize,
        path: PathBuf,
        source: ProcessorError,
    },

    #[error("sample index {0} is out of range")]
    OutOfRange(usize),

    #[error("batch error: {0}")]
    Batch(#[from] ProcessorError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("training dataset is empty")]
    EmptyDataset,

    #[error("batch has no labels")]
    MissingLabels,
}

/// Random-access collection of encoded samples.
pub trait Dataset {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Encoding, TrainError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bird images paired with their question and label.
pub struct BirdDataset<'a> {
    samples: BirdSamples,
    processor: &'a ViltProcessor,
}

impl<'a> BirdDataset<'a> {
    pub fn new(samples: BirdSamples, processor: &'a ViltProcessor) -> Self {
        Self { samples, processor }
    }

    pub fn samples(&self) -> &BirdSamples {
        &self.samples
    }
}

impl Dataset for BirdDataset<'_> {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Encoding, TrainError> {
        let sample = self
            .samples
            .get(index)
            .ok_or(TrainError::OutOfRange(index))?;
        let wrap = |source| TrainError::Sample {
            index,
            path: sample.image_path.clone(),
            source,
        };

        let image = processor::load_image(&sample.image_path).map_err(wrap)?;
        let mut encoding = self
            .processor
            .encode(&image, &sample.question)
            .map_err(wrap)?;
        encoding.label = Some(sample.label);
        Ok(encoding)
    }
}

/// Pads and stacks encodings into batches.
#[derive(Clone, Copy, Debug)]
pub struct Collator {
    pub image_size: usize,
    pub pad_id: u32,
}

impl Collator {
    pub fn from_processor(processor: &ViltProcessor) -> Self {
        Self {
            image_size: processor.image_size() as usize,
            pad_id: processor.pad_id(),
        }
    }

    pub fn collate(
        &self,
        encodings: &[Encoding],
        device: &Device,
    ) -> Result<EncodedBatch, ProcessorError> {
        processor::collate(encodings, self.image_size, self.pad_id, device)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    pub learning_rate: f64,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub num_train_epochs: usize,
    pub weight_decay: f64,
    pub logging_steps: usize,
    pub seed: u64,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            learning_rate: DEFAULT_LEARNING_RATE,
            train_batch_size: DEFAULT_BATCH_SIZE,
            eval_batch_size: DEFAULT_BATCH_SIZE,
            num_train_epochs: DEFAULT_EPOCHS,
            weight_decay: DEFAULT_WEIGHT_DECAY,
            logging_steps: DEFAULT_LOGGING_STEPS,
            seed: DEFAULT_SEED,
        }
    }
}

/// Mean training loss over one logging window.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: usize,
    pub loss: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvalMetrics {
    pub epoch: usize,
    pub samples: usize,
    pub loss: f32,
    pub accuracy: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainOutput {
    pub global_step: usize,
    /// Mean loss over every optimizer step.
    pub training_loss: f32,
    pub log_history: Vec<LogEntry>,
    pub eval_history: Vec<EvalMetrics>,
}

pub struct Trainer<'a> {
    model: &'a ViltForQuestionAnswering,
    varmap: &'a VarMap,
    collator: Collator,
    args: TrainingArgs,
    device: Device,
}

impl<'a> Trainer<'a> {
    /// `varmap` must hold every trainable variable of `model`.
    pub fn new(
        model: &'a ViltForQuestionAnswering,
        varmap: &'a VarMap,
        collator: Collator,
        args: TrainingArgs,
        device: Device,
    ) -> Self {
        Self {
            model,
            varmap,
            collator,
            args,
            device,
        }
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    fn batch(&self, dataset: &impl Dataset, indices: &[usize]) -> Result<EncodedBatch, TrainError> {
        let encodings = indices
            .iter()
            .map(|&i| dataset.get(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.collator.collate(&encodings, &self.device)?)
    }

    fn loss(&self, batch: &EncodedBatch) -> Result<(Tensor, Tensor), TrainError> {
        let labels = batch.labels.as_ref().ok_or(TrainError::MissingLabels)?;
        let logits = self.model.forward(batch)?;
        let loss = cross_entropy(&logits, labels)?;
        Ok((logits, loss))
    }

    /// Runs the configured number of epochs, evaluating after each one.
    pub fn train(
        &self,
        train: &impl Dataset,
        eval: Option<&impl Dataset>,
    ) -> Result<TrainOutput, TrainError> {
        if train.is_empty() {
            return Err(TrainError::EmptyDataset);
        }

        let params = ParamsAdamW {
            lr: self.args.learning_rate,
            weight_decay: self.args.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(self.varmap.all_vars(), params)?;
        let mut rng = StdRng::seed_from_u64(self.args.seed);
        let batch_size = self.args.train_batch_size.max(1);
        let logging_steps = self.args.logging_steps.max(1);

        let steps_per_epoch = train.len().div_ceil(batch_size);
        log::info!(
            "Training on {} samples for {} epochs ({} steps per epoch)",
            train.len(),
            self.args.num_train_epochs,
            steps_per_epoch
        );

        let mut output = TrainOutput::default();
        let mut total_loss = 0f32;
        let mut window_loss = 0f32;
        let mut window_steps = 0usize;

        for epoch in 1..=self.args.num_train_epochs {
            let mut order: Vec<usize> = (0..train.len()).collect();
            order.shuffle(&mut rng);

            for indices in order.chunks(batch_size) {
                let batch = self.batch(train, indices)?;
                let (_, loss) = self.loss(&batch)?;
                optimizer.backward_step(&loss)?;

                let loss = loss.to_scalar::<f32>()?;
                output.global_step += 1;
                total_loss += loss;
                window_loss += loss;
                window_steps += 1;

                if output.global_step % logging_steps == 0 {
                    let entry = LogEntry {
                        step: output.global_step,
                        epoch,
                        loss: window_loss / window_steps as f32,
                    };
                    log::info!(
                        "epoch {} step {}: loss {:.4}",
                        entry.epoch,
                        entry.step,
                        entry.loss
                    );
                    output.log_history.push(entry);
                    window_loss = 0.0;
                    window_steps = 0;
                }
            }

            if let Some(eval) = eval.filter(|e| !e.is_empty()) {
                let metrics = self.evaluate(eval, epoch)?;
                log::info!(
                    "epoch {} eval: loss {:.4}, accuracy {:.3} over {} samples",
                    epoch,
                    metrics.loss,
                    metrics.accuracy,
                    metrics.samples
                );
                output.eval_history.push(metrics);
            }
        }

        output.training_loss = total_loss / output.global_step.max(1) as f32;
        Ok(output)
    }

    /// Mean loss and accuracy over `dataset`, visited in order.
    pub fn evaluate(&self, dataset: &impl Dataset, epoch: usize) -> Result<EvalMetrics, TrainError> {
        let batch_size = self.args.eval_batch_size.max(1);
        let order: Vec<usize> = (0..dataset.len()).collect();
        let mut loss_sum = 0f32;
        let mut correct = 0f32;

        for indices in order.chunks(batch_size) {
            let batch = self.batch(dataset, indices)?;
            let (logits, loss) = self.loss(&batch)?;
            loss_sum += loss.to_scalar::<f32>()? * indices.len() as f32;

            let labels = batch.labels.as_ref().ok_or(TrainError::MissingLabels)?;
            correct += logits
                .argmax(D::Minus1)?
                .eq(labels)?
                .to_dtype(DType::F32)?
                .sum_all()?
                .to_scalar::<f32>()?;
        }

        let samples = dataset.len();
        let denom = samples.max(1) as f32;
        Ok(EvalMetrics {
            epoch,
            samples,
            loss: loss_sum / denom,
            accuracy: correct / denom,
        })
    }
}
