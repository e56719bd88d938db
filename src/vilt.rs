//! ViLT (Vision-and-Language Transformer) for visual question answering.
//!
//! Text tokens and image patches are embedded separately, tagged with a
//! modality embedding, concatenated and run through one transformer
//! encoder. The pooled first token feeds a two-layer classifier whose
//! outputs index into the label vocabulary.
//!
//! Images are expected on a fixed `image_size x image_size` canvas so the
//! patch grid always matches the learned position embeddings.
//!
//! Layer names follow the Hugging Face checkpoint layout, so pretrained
//! weights load without renaming.

use crate::processor::EncodedBatch;
use candle_core::{D, DType, IndexOp, Module, Result, Tensor};
use candle_nn::{
    Conv2d, Conv2dConfig, Embedding, Init, Linear, VarBuilder, conv2d, embedding, linear,
    linear_no_bias,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MIN_VALUE_F64: f64 = f32::MIN as f64;
const CLASSIFIER_LAYER_NORM_EPS: f64 = 1e-5;

/// Variable prefix of the final classifier layer, the one replaced when
/// fine-tuning on a new label set.
pub const HEAD_PREFIX: &str = "classifier.3";

fn default_modality_type_vocab_size() -> usize {
    2
}

fn default_qkv_bias() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViltConfig {
    pub vocab_size: usize,
    pub type_vocab_size: usize,
    #[serde(default = "default_modality_type_vocab_size")]
    pub modality_type_vocab_size: usize,
    pub max_position_embeddings: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub layer_norm_eps: f64,
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,
    #[serde(default)]
    pub id2label: BTreeMap<String, String>,
    #[serde(default)]
    pub label2id: BTreeMap<String, usize>,
    /// Fields this crate does not interpret, kept so saved configs stay complete.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ViltConfig {
    /// The `vilt-b32` architecture with an empty label vocabulary.
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            type_vocab_size: 2,
            modality_type_vocab_size: 2,
            max_position_embeddings: 40,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            layer_norm_eps: 1e-12,
            image_size: 384,
            patch_size: 32,
            num_channels: 3,
            qkv_bias: true,
            id2label: BTreeMap::new(),
            label2id: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl ViltConfig {
    pub fn num_patches(&self) -> usize {
        let side = self.image_size / self.patch_size;
        side * side
    }

    pub fn labels(&self) -> LabelVocabulary {
        LabelVocabulary::from_id2label(&self.id2label)
    }

    pub fn num_labels(&self) -> usize {
        self.labels().len()
    }

    /// Returns a copy whose label vocabulary is `names`, indexed by position.
    pub fn with_labels(&self, names: &[String]) -> Self {
        let mut config = self.clone();
        config.id2label = names
            .iter()
            .enumerate()
            .map(|(i, name)| (i.to_string(), name.clone()))
            .collect();
        config.label2id = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        config
    }
}

/// Maps output class indices to answer strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelVocabulary(Vec<String>);

impl LabelVocabulary {
    pub fn new(labels: Vec<String>) -> Self {
        Self(labels)
    }

    /// Builds the vocabulary from a `{"0": "yes", "1": "no", ...}` map.
    /// Keys that are not integers are ignored; gaps get `LABEL_<i>`.
    pub fn from_id2label(id2label: &BTreeMap<String, String>) -> Self {
        let entries: Vec<(usize, &String)> = id2label
            .iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|k| (k, v)))
            .collect();
        let len = entries.iter().map(|(k, _)| k + 1).max().unwrap_or(0);
        let mut labels: Vec<String> = (0..len).map(|i| format!("LABEL_{i}")).collect();
        for (k, v) in entries {
            labels[k] = v.clone();
        }
        Self(labels)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Layer normalization built from differentiable primitives.
#[derive(Debug, Clone)]
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

#[derive(Debug, Clone)]
struct TextEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl TextEmbeddings {
    fn new(config: &ViltConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            word_embeddings: embedding(config.vocab_size, hidden, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                hidden,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                config.type_vocab_size,
                hidden,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: LayerNorm::new(hidden, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let words = self.word_embeddings.forward(input_ids)?;
        let types = self.token_type_embeddings.forward(token_type_ids)?;
        let positions = self.position_embeddings.forward(&position_ids)?;
        let embeddings = (words + types)?.broadcast_add(&positions)?;
        self.layer_norm.forward(&embeddings)
    }
}

#[derive(Debug, Clone)]
struct ViltEmbeddings {
    text_embeddings: TextEmbeddings,
    patch_projection: Conv2d,
    cls_token: Tensor,
    position_embeddings: Tensor,
    token_type_embeddings: Embedding,
    num_patches: usize,
    image_size: usize,
}

impl ViltEmbeddings {
    fn new(config: &ViltConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let num_patches = config.num_patches();
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        Ok(Self {
            text_embeddings: TextEmbeddings::new(config, vb.pp("text_embeddings"))?,
            patch_projection: conv2d(
                config.num_channels,
                hidden,
                config.patch_size,
                conv_config,
                vb.pp("patch_embeddings").pp("projection"),
            )?,
            cls_token: vb.get((1, 1, hidden), "cls_token")?,
            position_embeddings: vb.get((1, num_patches + 1, hidden), "position_embeddings")?,
            token_type_embeddings: embedding(
                config.modality_type_vocab_size,
                hidden,
                vb.pp("token_type_embeddings"),
            )?,
            num_patches,
            image_size: config.image_size,
        })
    }

    /// Patch embeddings with a leading class token: `(batch, patches + 1, hidden)`.
    fn visual_embed(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let patches = self.patch_projection.forward(pixel_values)?;
        let (batch, hidden, grid_h, grid_w) = patches.dims4()?;
        if grid_h * grid_w != self.num_patches {
            candle_core::bail!(
                "expected a {0}x{0} image canvas, got a {grid_h}x{grid_w} patch grid",
                self.image_size
            );
        }
        let patches = patches.flatten_from(2)?.transpose(1, 2)?;
        let cls = self.cls_token.broadcast_as((batch, 1, hidden))?;
        let tokens = Tensor::cat(&[&cls, &patches], 1)?;
        tokens.broadcast_add(&self.position_embeddings)
    }

    /// Returns the joint embeddings and the joint `(batch, seq)` f32 mask.
    fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        attention_mask: &Tensor,
        pixel_values: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let device = input_ids.device();
        let (batch, seq_len) = input_ids.dims2()?;

        let text_modality = Tensor::zeros((batch, seq_len), DType::U32, device)?;
        let text = self.text_embeddings.forward(input_ids, token_type_ids)?;
        let text = (text + self.token_type_embeddings.forward(&text_modality)?)?;

        let image = self.visual_embed(pixel_values)?;
        let image_len = image.dim(1)?;
        let image_modality = Tensor::ones((batch, image_len), DType::U32, device)?;
        let image = (image + self.token_type_embeddings.forward(&image_modality)?)?;

        let image_mask = Tensor::ones((batch, image_len), attention_mask.dtype(), device)?;
        let embeddings = Tensor::cat(&[&text, &image], 1)?;
        let mask = Tensor::cat(&[attention_mask, &image_mask], 1)?;
        Ok((embeddings, mask))
    }
}

#[derive(Debug, Clone)]
struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(config: &ViltConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let qkv = |name: &str| {
            let vb = vb.pp("attention").pp(name);
            if config.qkv_bias {
                linear(hidden, hidden, vb)
            } else {
                linear_no_bias(hidden, hidden, vb)
            }
        };
        Ok(Self {
            query: qkv("query")?,
            key: qkv("key")?,
            value: qkv("value")?,
            output: linear(hidden, hidden, vb.pp("output").pp("dense"))?,
            num_heads: config.num_attention_heads,
            head_dim: hidden / config.num_attention_heads,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, hidden) = xs.dims3()?;
        let heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(self.query.forward(xs)?)?;
        let k = heads(self.key.forward(xs)?)?;
        let v = heads(self.value.forward(xs)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, hidden))?;
        self.output.forward(&context)
    }
}

#[derive(Debug, Clone)]
struct ViltLayer {
    attention: Attention,
    layernorm_before: LayerNorm,
    layernorm_after: LayerNorm,
    intermediate: Linear,
    output: Linear,
}

impl ViltLayer {
    fn new(config: &ViltConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let eps = config.layer_norm_eps;
        Ok(Self {
            attention: Attention::new(config, vb.pp("attention"))?,
            layernorm_before: LayerNorm::new(hidden, eps, vb.pp("layernorm_before"))?,
            layernorm_after: LayerNorm::new(hidden, eps, vb.pp("layernorm_after"))?,
            intermediate: linear(
                hidden,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: linear(config.intermediate_size, hidden, vb.pp("output").pp("dense"))?,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let attended = self
            .attention
            .forward(&self.layernorm_before.forward(xs)?, mask)?;
        let xs = (attended + xs)?;
        let hidden = self
            .intermediate
            .forward(&self.layernorm_after.forward(&xs)?)?
            .gelu_erf()?;
        self.output.forward(&hidden)? + xs
    }
}

/// The shared encoder trunk, ending in the pooled first token.
#[derive(Debug, Clone)]
struct ViltModel {
    embeddings: ViltEmbeddings,
    layers: Vec<ViltLayer>,
    layernorm: LayerNorm,
    pooler: Linear,
}

impl ViltModel {
    fn new(config: &ViltConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..config.num_hidden_layers)
            .map(|i| ViltLayer::new(config, vb.pp("encoder").pp("layer").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embeddings: ViltEmbeddings::new(config, vb.pp("embeddings"))?,
            layers,
            layernorm: LayerNorm::new(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("layernorm"),
            )?,
            pooler: linear(
                config.hidden_size,
                config.hidden_size,
                vb.pp("pooler").pp("dense"),
            )?,
        })
    }

    fn forward(&self, batch: &EncodedBatch) -> Result<Tensor> {
        let attention_mask = batch.attention_mask.to_dtype(DType::F32)?;
        let (mut xs, mask) = self.embeddings.forward(
            &batch.input_ids,
            &batch.token_type_ids,
            &attention_mask,
            &batch.pixel_values,
        )?;

        // 0 where attended, a large negative value where masked.
        let additive = mask
            .affine(-1.0, 1.0)?
            .affine(MIN_VALUE_F64, 0.0)?
            .unsqueeze(1)?
            .unsqueeze(1)?;

        for layer in &self.layers {
            xs = layer.forward(&xs, &additive)?;
        }
        let xs = self.layernorm.forward(&xs)?;
        self.pooler.forward(&xs.i((.., 0))?)?.tanh()
    }
}

/// ViLT with the question-answering classifier head.
#[derive(Debug, Clone)]
pub struct ViltForQuestionAnswering {
    vilt: ViltModel,
    classifier_in: Linear,
    classifier_norm: LayerNorm,
    classifier_out: Linear,
    labels: LabelVocabulary,
    config: ViltConfig,
}

impl ViltForQuestionAnswering {
    /// Builds the network; the head is sized by the config's label vocabulary.
    pub fn new(config: &ViltConfig, vb: VarBuilder) -> Result<Self> {
        let labels = config.labels();
        if labels.is_empty() {
            candle_core::bail!("config has an empty id2label map");
        }
        let hidden = config.hidden_size;
        Ok(Self {
            vilt: ViltModel::new(config, vb.pp("vilt"))?,
            classifier_in: linear(hidden, hidden * 2, vb.pp("classifier.0"))?,
            classifier_norm: LayerNorm::new(
                hidden * 2,
                CLASSIFIER_LAYER_NORM_EPS,
                vb.pp("classifier.1"),
            )?,
            classifier_out: linear(hidden * 2, labels.len(), vb.pp(HEAD_PREFIX))?,
            labels,
            config: config.clone(),
        })
    }

    /// Returns `(batch, num_labels)` logits.
    pub fn forward(&self, batch: &EncodedBatch) -> Result<Tensor> {
        let pooled = self.vilt.forward(batch)?;
        let hidden = self.classifier_in.forward(&pooled)?;
        let hidden = self.classifier_norm.forward(&hidden)?.gelu_erf()?;
        self.classifier_out.forward(&hidden)
    }

    pub fn labels(&self) -> &LabelVocabulary {
        &self.labels
    }

    pub fn config(&self) -> &ViltConfig {
        &self.config
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::processor::{Encoding, collate};
    use candle_core::Device;
    use candle_nn::VarMap;

    pub(crate) fn tiny_config(labels: usize) -> ViltConfig {
        let names: Vec<String> = (0..labels).map(|i| format!("bird_{i}")).collect();
        ViltConfig {
            vocab_size: 16,
            max_position_embeddings: 8,
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            image_size: 8,
            patch_size: 4,
            ..Default::default()
        }
        .with_labels(&names)
    }

    pub(crate) fn tiny_encoding(ids: &[u32], label: Option<u32>) -> Encoding {
        Encoding {
            input_ids: ids.to_vec(),
            token_type_ids: vec![0; ids.len()],
            attention_mask: vec![1; ids.len()],
            pixel_values: (0..3 * 8 * 8).map(|i| (i % 7) as f32 / 7.0).collect(),
            label,
        }
    }

    #[test]
    fn vocabulary_fills_gaps() {
        let mut map = BTreeMap::new();
        map.insert("0".to_string(), "yes".to_string());
        map.insert("2".to_string(), "no".to_string());
        map.insert("x".to_string(), "ignored".to_string());
        let vocab = LabelVocabulary::from_id2label(&map);
        assert_eq!(vocab.as_slice(), &["yes", "LABEL_1", "no"]);
        assert_eq!(vocab.get(2), Some("no"));
        assert_eq!(vocab.get(3), None);
    }

    #[test]
    fn config_round_trips_unknown_fields() -> serde_json::Result<()> {
        let json = r#"{
            "vocab_size": 30522, "type_vocab_size": 2, "max_position_embeddings": 40,
            "hidden_size": 768, "num_hidden_layers": 12, "num_attention_heads": 12,
            "intermediate_size": 3072, "layer_norm_eps": 1e-12, "image_size": 384,
            "patch_size": 32, "num_channels": 3, "model_type": "vilt",
            "id2label": {"0": "net", "1": "pitcher"}, "label2id": {"net": 0, "pitcher": 1}
        }"#;
        let config: ViltConfig = serde_json::from_str(json)?;
        assert_eq!(config.num_labels(), 2);
        assert_eq!(config.modality_type_vocab_size, 2);
        assert!(config.qkv_bias);
        assert_eq!(config.num_patches(), 144);

        let saved = serde_json::to_value(&config)?;
        assert_eq!(saved["model_type"], "vilt");
        Ok(())
    }

    #[test]
    fn with_labels_rebuilds_both_maps() {
        let config = ViltConfig::default().with_labels(&["Robin".into(), "Crow".into()]);
        assert_eq!(config.id2label.get("1").map(String::as_str), Some("Crow"));
        assert_eq!(config.label2id.get("Robin"), Some(&0));
        assert_eq!(config.num_labels(), 2);
    }

    #[test]
    fn forward_produces_one_logit_per_label() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ViltForQuestionAnswering::new(&tiny_config(5), vb)?;

        let batch = collate(
            &[tiny_encoding(&[1, 2, 3], None), tiny_encoding(&[1, 2], None)],
            8,
            0,
            &device,
        )
        .map_err(candle_core::Error::wrap)?;
        let logits = model.forward(&batch)?;
        assert_eq!(logits.dims(), &[2, 5]);
        assert_eq!(model.labels().len(), 5);
        Ok(())
    }

    #[test]
    fn wrong_canvas_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ViltForQuestionAnswering::new(&tiny_config(2), vb)?;

        let mut encoding = tiny_encoding(&[1], None);
        encoding.pixel_values = vec![0.0; 3 * 12 * 12];
        let batch = collate(&[encoding], 12, 0, &device).map_err(candle_core::Error::wrap)?;
        assert!(model.forward(&batch).is_err());
        Ok(())
    }

    #[test]
    fn empty_vocabulary_is_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ViltConfig {
            hidden_size: 8,
            ..tiny_config(0)
        };
        assert!(ViltForQuestionAnswering::new(&config, vb).is_err());
    }
}
