//! Turns (image, question) pairs into model-ready tensors.
//!
//! Images are converted to RGB, resized to a square canvas, rescaled to
//! `[0, 1]` and normalized per channel. Questions go through the model's
//! tokenizer with special tokens and truncation.

use candle_core::{Device, Tensor};
use image::{RgbImage, imageops::FilterType};
use std::path::Path;
use tokenizers::{Tokenizer, TruncationParams};

/// Per-channel mean used by the pretrained image featurizer.
pub const IMAGE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
/// Per-channel standard deviation used by the pretrained image featurizer.
pub const IMAGE_STD: [f32; 3] = [0.5, 0.5, 0.5];

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("cannot collate an empty batch")]
    EmptyBatch,

    #[error("batch mixes labeled and unlabeled encodings")]
    MixedLabels,

    #[error("pixel buffer has {got} values, expected {expected}")]
    PixelShape { got: usize, expected: usize },
}

/// Model inputs for a single (image, question) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Encoding {
    pub input_ids: Vec<u32>,
    pub token_type_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Channel-planar `3 x size x size` normalized pixels.
    pub pixel_values: Vec<f32>,
    /// Target class, present only for training samples.
    pub label: Option<u32>,
}

/// A padded batch of encodings on a device.
#[derive(Debug)]
pub struct EncodedBatch {
    /// `(batch, seq)` u32 token ids.
    pub input_ids: Tensor,
    /// `(batch, seq)` u32 segment ids.
    pub token_type_ids: Tensor,
    /// `(batch, seq)` u32, 1 for real tokens and 0 for padding.
    pub attention_mask: Tensor,
    /// `(batch, 3, size, size)` f32.
    pub pixel_values: Tensor,
    /// `(batch,)` u32 targets.
    pub labels: Option<Tensor>,
}

/// Decodes an image file into RGB.
pub fn load_image(path: impl AsRef<Path>) -> Result<RgbImage, ProcessorError> {
    Ok(image::open(path)?.to_rgb8())
}

/// Decodes in-memory image bytes (any supported format) into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ProcessorError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Resizes `image` to `size x size` and returns normalized channel-planar pixels.
pub fn pixel_values(image: &RgbImage, size: u32) -> Vec<f32> {
    let resized = if image.dimensions() == (size, size) {
        image.clone()
    } else {
        image::imageops::resize(image, size, size, FilterType::CatmullRom)
    };

    let plane = (size * size) as usize;
    let mut out = vec![0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = (y * size + x) as usize;
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            out[c * plane + offset] = (value - IMAGE_MEAN[c]) / IMAGE_STD[c];
        }
    }
    out
}

/// Pads `encodings` to the longest sequence and stacks them into tensors.
pub fn collate(
    encodings: &[Encoding],
    image_size: usize,
    pad_id: u32,
    device: &Device,
) -> Result<EncodedBatch, ProcessorError> {
    if encodings.is_empty() {
        return Err(ProcessorError::EmptyBatch);
    }

    let batch = encodings.len();
    let seq_len = encodings
        .iter()
        .map(|e| e.input_ids.len())
        .max()
        .unwrap_or(0);
    let pixels_per_image = 3 * image_size * image_size;

    let mut input_ids = Vec::with_capacity(batch * seq_len);
    let mut token_type_ids = Vec::with_capacity(batch * seq_len);
    let mut attention_mask = Vec::with_capacity(batch * seq_len);
    let mut pixels = Vec::with_capacity(batch * pixels_per_image);

    for encoding in encodings {
        if encoding.pixel_values.len() != pixels_per_image {
            return Err(ProcessorError::PixelShape {
                got: encoding.pixel_values.len(),
                expected: pixels_per_image,
            });
        }
        let pad = seq_len - encoding.input_ids.len();
        input_ids.extend_from_slice(&encoding.input_ids);
        input_ids.extend(std::iter::repeat_n(pad_id, pad));
        token_type_ids.extend_from_slice(&encoding.token_type_ids);
        token_type_ids.extend(std::iter::repeat_n(0, pad));
        attention_mask.extend_from_slice(&encoding.attention_mask);
        attention_mask.extend(std::iter::repeat_n(0, pad));
        pixels.extend_from_slice(&encoding.pixel_values);
    }

    let labels = match encodings.iter().filter(|e| e.label.is_some()).count() {
        0 => None,
        n if n == batch => {
            let labels: Vec<u32> = encodings.iter().filter_map(|e| e.label).collect();
            Some(Tensor::from_vec(labels, batch, device)?)
        }
        _ => return Err(ProcessorError::MixedLabels),
    };

    Ok(EncodedBatch {
        input_ids: Tensor::from_vec(input_ids, (batch, seq_len), device)?,
        token_type_ids: Tensor::from_vec(token_type_ids, (batch, seq_len), device)?,
        attention_mask: Tensor::from_vec(attention_mask, (batch, seq_len), device)?,
        pixel_values: Tensor::from_vec(pixels, (batch, 3, image_size, image_size), device)?,
        labels,
    })
}

/// Tokenizer plus image featurizer for the ViLT network.
#[derive(Clone)]
pub struct ViltProcessor {
    tokenizer: Tokenizer,
    image_size: u32,
    pad_id: u32,
}

impl ViltProcessor {
    /// Wraps `tokenizer`, truncating questions to `max_text_len` tokens.
    pub fn new(
        mut tokenizer: Tokenizer,
        image_size: u32,
        max_text_len: usize,
    ) -> Result<Self, ProcessorError> {
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("[PAD]"))
            .unwrap_or(0);

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_text_len,
                ..Default::default()
            }))
            .map_err(|e| ProcessorError::Tokenizer(e.to_string()))?;
        tokenizer.with_padding(None);

        Ok(Self {
            tokenizer,
            image_size,
            pad_id,
        })
    }

    pub fn from_file(
        tokenizer_path: impl AsRef<Path>,
        image_size: u32,
        max_text_len: usize,
    ) -> Result<Self, ProcessorError> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| ProcessorError::Tokenizer(e.to_string()))?;
        Self::new(tokenizer, image_size, max_text_len)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Encodes one image and question. The label is left empty.
    pub fn encode(&self, image: &RgbImage, question: &str) -> Result<Encoding, ProcessorError> {
        let tokens = self
            .tokenizer
            .encode(question, true)
            .map_err(|e| ProcessorError::Tokenizer(e.to_string()))?;

        Ok(Encoding {
            input_ids: tokens.get_ids().to_vec(),
            token_type_ids: tokens.get_type_ids().to_vec(),
            attention_mask: tokens.get_attention_mask().to_vec(),
            pixel_values: pixel_values(image, self.image_size),
            label: None,
        })
    }

    /// Collates encodings produced by this processor.
    pub fn collate(
        &self,
        encodings: &[Encoding],
        device: &Device,
    ) -> Result<EncodedBatch, ProcessorError> {
        collate(encodings, self.image_size as usize, self.pad_id, device)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;
    use std::str::FromStr;

    /// Word-level tokenizer over the training question, ids below 16.
    pub(crate) fn tiny_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {
                    "[PAD]": 0, "[UNK]": 1, "Which": 2, "bird": 3,
                    "is": 4, "in": 5, "the": 6, "image": 7, "?": 8
                },
                "unk_token": "[UNK]"
            }
        }"#;
        Tokenizer::from_str(json).unwrap()
    }

    #[test]
    fn processor_encodes_question_and_image() -> Result<(), ProcessorError> {
        let processor = ViltProcessor::new(tiny_tokenizer(), 4, 3)?;
        assert_eq!(processor.pad_id(), 0);

        let image = RgbImage::from_pixel(5, 2, Rgb([255, 0, 0]));
        let encoding = processor.encode(&image, "Which bird is in the image?")?;
        assert_eq!(encoding.input_ids, vec![2, 3, 4]);
        assert_eq!(encoding.attention_mask, vec![1, 1, 1]);
        assert_eq!(encoding.pixel_values.len(), 3 * 4 * 4);
        assert_eq!(encoding.label, None);
        Ok(())
    }

    #[test]
    fn pixels_are_normalized_to_unit_range() {
        let white = RgbImage::from_pixel(1, 1, Rgb([255, 255, 255]));
        assert_eq!(pixel_values(&white, 1), vec![1.0, 1.0, 1.0]);

        let black = RgbImage::from_pixel(1, 1, Rgb([0, 0, 0]));
        assert_eq!(pixel_values(&black, 1), vec![-1.0, -1.0, -1.0]);
    }

    #[test]
    fn pixels_are_channel_planar() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        // Square canvas of the same width keeps the first row intact.
        let img = image::imageops::resize(&img, 2, 2, FilterType::Nearest);
        let values = pixel_values(&img, 2);
        assert_eq!(values.len(), 12);
        assert_eq!(&values[0..2], &[1.0, -1.0]);
        assert_eq!(&values[4..6], &[-1.0, 1.0]);
        assert_eq!(&values[8..10], &[-1.0, -1.0]);
    }

    #[test]
    fn resize_produces_fixed_canvas() {
        let img = RgbImage::from_pixel(7, 3, Rgb([10, 20, 30]));
        assert_eq!(pixel_values(&img, 4).len(), 3 * 4 * 4);
    }

    fn encoding(ids: &[u32], label: Option<u32>) -> Encoding {
        Encoding {
            input_ids: ids.to_vec(),
            token_type_ids: vec![0; ids.len()],
            attention_mask: vec![1; ids.len()],
            pixel_values: vec![0.0; 3 * 2 * 2],
            label,
        }
    }

    #[test]
    fn collate_pads_to_longest() -> Result<(), ProcessorError> {
        let batch = collate(
            &[encoding(&[101, 7, 102], Some(1)), encoding(&[101, 102], Some(0))],
            2,
            0,
            &Device::Cpu,
        )?;
        assert_eq!(batch.input_ids.dims(), &[2, 3]);
        assert_eq!(
            batch.input_ids.to_vec2::<u32>()?,
            vec![vec![101, 7, 102], vec![101, 102, 0]]
        );
        assert_eq!(
            batch.attention_mask.to_vec2::<u32>()?,
            vec![vec![1, 1, 1], vec![1, 1, 0]]
        );
        assert_eq!(batch.pixel_values.dims(), &[2, 3, 2, 2]);
        let labels = batch.labels.as_ref().map(|l| l.to_vec1::<u32>());
        assert_eq!(labels.transpose()?, Some(vec![1, 0]));
        Ok(())
    }

    #[test]
    fn collate_rejects_mixed_labels_and_empty() {
        let mixed = collate(
            &[encoding(&[1], Some(1)), encoding(&[1], None)],
            2,
            0,
            &Device::Cpu,
        );
        assert!(matches!(mixed, Err(ProcessorError::MixedLabels)));
        assert!(matches!(
            collate(&[], 2, 0, &Device::Cpu),
            Err(ProcessorError::EmptyBatch)
        ));
    }

    #[test]
    fn collate_checks_pixel_count() {
        let result = collate(&[encoding(&[1], None)], 3, 0, &Device::Cpu);
        assert!(matches!(
            result,
            Err(ProcessorError::PixelShape {
                got: 12,
                expected: 27
            })
        ));
    }
}
