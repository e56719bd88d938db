use argh::FromArgs;
use std::path::PathBuf;
use vqa_birds::{
    VqaModel, VqaPipeline, VqaRequest,
    checkpoint::{self, DEFAULT_MODEL_ID, FinetuneSetup, ModelFiles},
    dataset::{self, BirdSamples},
    processor::load_image,
    trainer::{
        BirdDataset, Collator, Dataset, DEFAULT_BATCH_SIZE, DEFAULT_EPOCHS,
        DEFAULT_LEARNING_RATE, DEFAULT_LOGGING_STEPS, DEFAULT_OUTPUT_DIR, DEFAULT_SEED,
        DEFAULT_WEIGHT_DECAY, Trainer, TrainingArgs,
    },
};

const DEFAULT_DATASET_DIR: &str = "./dataset";
const TRAIN_FRACTION: f64 = 0.8;

#[derive(FromArgs)]
/// Fine-tunes the question-answering model on a bird-species dataset.
struct FinetuneArgs {
    /// dataset base directory holding classes.txt and images/
    #[argh(option, short = 'd', default = "PathBuf::from(DEFAULT_DATASET_DIR)")]
    dataset: PathBuf,

    /// hub id or local directory of the pretrained model
    #[argh(option, short = 'm', default = "DEFAULT_MODEL_ID.to_string()")]
    model: String,

    /// where the fine-tuned checkpoint is written
    #[argh(option, short = 'o', default = "PathBuf::from(DEFAULT_OUTPUT_DIR)")]
    output_dir: PathBuf,

    /// optimizer learning rate
    #[argh(option, default = "DEFAULT_LEARNING_RATE")]
    learning_rate: f64,

    /// samples per batch for training and evaluation
    #[argh(option, default = "DEFAULT_BATCH_SIZE")]
    batch_size: usize,

    /// number of passes over the training set
    #[argh(option, default = "DEFAULT_EPOCHS")]
    epochs: usize,

    /// weight decay applied by the optimizer
    #[argh(option, default = "DEFAULT_WEIGHT_DECAY")]
    weight_decay: f64,

    /// optimizer steps between loss log lines
    #[argh(option, default = "DEFAULT_LOGGING_STEPS")]
    logging_steps: usize,

    /// seed for the split and per-epoch shuffling
    #[argh(option, default = "DEFAULT_SEED")]
    seed: u64,

    /// split train/validation by position instead of after a seeded shuffle
    #[argh(switch)]
    sequential_split: bool,

    /// run on CPU even if a GPU is available
    #[argh(switch)]
    cpu: bool,
}

fn split(samples: &BirdSamples, sequential: bool, seed: u64) -> (BirdSamples, BirdSamples) {
    if sequential {
        samples.split(TRAIN_FRACTION)
    } else {
        samples.shuffled(seed).split(TRAIN_FRACTION)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: FinetuneArgs = argh::from_env();

    let loaded = dataset::load_dataset(&args.dataset);
    if loaded.samples.is_empty() {
        log::error!("No images loaded. Please check the dataset paths.");
        return Ok(());
    }
    let labels = loaded.label_names();
    log::info!(
        "Loaded {} images for {} labels",
        loaded.samples.len(),
        labels.len()
    );

    let device = checkpoint::select_device(args.cpu)?;
    let setup = ModelFiles::locate(&args.model)
        .and_then(|files| checkpoint::load_for_finetuning(&files, &labels, &device));
    let FinetuneSetup {
        model,
        varmap,
        processor,
    } = match setup {
        Ok(setup) => setup,
        Err(e) => {
            log::error!("Error loading model: {e}");
            return Ok(());
        }
    };

    let (train_samples, val_samples) = split(&loaded.samples, args.sequential_split, args.seed);
    let train_dataset = BirdDataset::new(train_samples, &processor);
    let val_dataset = BirdDataset::new(val_samples, &processor);
    log::info!(
        "Split into {} training and {} validation samples",
        train_dataset.len(),
        val_dataset.len()
    );

    let training_args = TrainingArgs {
        output_dir: args.output_dir,
        learning_rate: args.learning_rate,
        train_batch_size: args.batch_size,
        eval_batch_size: args.batch_size,
        num_train_epochs: args.epochs,
        weight_decay: args.weight_decay,
        logging_steps: args.logging_steps,
        seed: args.seed,
    };
    let trainer = Trainer::new(
        &model,
        &varmap,
        Collator::from_processor(&processor),
        training_args.clone(),
        device.clone(),
    );
    let output = trainer.train(&train_dataset, Some(&val_dataset))?;
    log::info!(
        "Finished {} steps, mean training loss {:.4}",
        output.global_step,
        output.training_loss
    );

    checkpoint::save_pretrained(
        &training_args.output_dir,
        model.config(),
        &varmap,
        &processor,
    )?;

    // sample prediction on the first validation image
    let Some(sample) = val_dataset.samples().get(0) else {
        return Ok(());
    };
    let image = load_image(&sample.image_path)?;
    let pipeline = VqaPipeline::new(model, processor.clone(), device);
    let answer = pipeline.answer(&VqaRequest {
        image,
        question: sample.question.clone(),
    })?;
    log::info!(
        "Predicted answer: {} for {}",
        answer.label,
        sample.image_path.display()
    );

    Ok(())
}
