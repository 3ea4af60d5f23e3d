//! LoRA (Low-Rank Adaptation) adapters for the Flux transformer.
//!
//! An adapter stores a pair of low-rank matrices per adapted layer. The weight
//! actually used is `W' = W + strength * (alpha / rank) * (up @ down)`, fused
//! while the transformer weights are loaded, see [`LoraFusedWeights`].
//!
//! Three key layouts are understood:
//! - kohya: `lora_unet_double_blocks_0_img_attn_qkv.lora_down.weight`
//! - diffusers/PEFT: `transformer.transformer_blocks.0.attn.to_q.lora_A.weight`
//! - native: `double_blocks.0.img_attn.qkv.lora_A.weight`
//!
//! Diffusers adapters train the separate q/k/v projections, which the Flux
//! checkpoint stores fused, so their deltas are stacked onto the fused layer.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use tracing::{debug, info, warn};

const KEY_PREFIXES: [&str; 3] = ["transformer.", "diffusion_model.", "base_model.model."];
const DOWN_SUFFIXES: [&str; 2] = [".lora_down.weight", ".lora_A.weight"];
const UP_SUFFIXES: [&str; 2] = [".lora_up.weight", ".lora_B.weight"];

#[derive(Debug)]
pub struct LoraPair {
    /// `[rank, in_features]`
    down: Tensor,
    /// `[out_features, rank]`
    up: Tensor,
    alpha: f64,
}

impl LoraPair {
    pub fn rank(&self) -> usize {
        self.down.dims().first().copied().unwrap_or(0)
    }

    /// Dense `[out_features, in_features]` delta at strength 1.
    fn delta(&self) -> candle_core::Result<Tensor> {
        let scale = self.alpha / self.rank().max(1) as f64;
        self.up.matmul(&self.down)? * scale
    }
}

#[derive(Debug)]
pub struct LoraAdapter {
    pub name: String,
    pairs: HashMap<String, LoraPair>,
}

impl LoraAdapter {
    /// Loads an adapter from a `.safetensors` file. Tensors are kept as f32 on
    /// `device`.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading LoRA adapter");

        let data = std::fs::read(path)
            .with_context(|| format!("failed to read LoRA file {}", path.display()))?;
        let file = SafeTensors::deserialize(&data)
            .with_context(|| format!("failed to parse LoRA file {}", path.display()))?;

        let mut tensors = HashMap::new();
        for (key, view) in file.tensors() {
            let tensor = view_to_tensor(&view, device)
                .with_context(|| format!("failed to load LoRA tensor {key}"))?;
            tensors.insert(key, tensor.to_dtype(DType::F32)?);
        }

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lora".to_string());
        let adapter = Self::from_tensors(name, tensors)?;
        info!(
            name = %adapter.name,
            pairs = adapter.len(),
            "LoRA adapter loaded"
        );
        Ok(adapter)
    }

    /// Pairs up `down`/`up` matrices and their optional `alpha` by module name.
    pub fn from_tensors(name: String, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut downs = HashMap::new();
        let mut ups = HashMap::new();
        let mut alphas = HashMap::new();

        for (key, tensor) in tensors {
            let key = strip_prefix(&key);
            if let Some(module) = key.strip_suffix(".alpha") {
                let alpha = tensor
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_device(&Device::Cpu)?
                    .to_vec1::<f32>()?
                    .first()
                    .copied()
                    .with_context(|| format!("empty alpha tensor for {module}"))?;
                alphas.insert(module.to_string(), f64::from(alpha));
            } else if let Some(module) = strip_any_suffix(key, &DOWN_SUFFIXES) {
                downs.insert(module.to_string(), tensor);
            } else if let Some(module) = strip_any_suffix(key, &UP_SUFFIXES) {
                ups.insert(module.to_string(), tensor);
            } else {
                debug!(key, "Ignoring non-LoRA tensor");
            }
        }

        let mut pairs = HashMap::new();
        for (module, down) in downs {
            let Some(up) = ups.remove(&module) else {
                warn!(module = %module, "LoRA down matrix without matching up matrix");
                continue;
            };
            if down.rank() != 2 || up.rank() != 2 {
                anyhow::bail!("LoRA matrices for {module} must be 2D");
            }
            let rank = down.dim(0)?;
            if up.dim(1)? != rank {
                anyhow::bail!(
                    "LoRA rank mismatch for {module}: down {:?}, up {:?}",
                    down.dims(),
                    up.dims()
                );
            }
            let alpha = alphas.get(&module).copied().unwrap_or(rank as f64);
            debug!(module = %module, rank, alpha, "Loaded LoRA pair");
            pairs.insert(module, LoraPair { down, up, alpha });
        }
        for module in ups.keys() {
            warn!(module = %module, "LoRA up matrix without matching down matrix");
        }

        Ok(Self { name, pairs })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn rank(&self) -> Option<usize> {
        self.pairs.values().map(LoraPair::rank).max()
    }

    /// Names of the loaded pairs, sorted.
    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pairs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Pairs making up the Flux `module`, in row order. `None` marks a part the
    /// adapter does not train.
    fn resolve(&self, module: &str) -> Option<Vec<Option<(&str, &LoraPair)>>> {
        let direct = self
            .pairs
            .get_key_value(module)
            .or_else(|| self.pairs.get_key_value(&kohya_key(module)));
        if let Some((key, pair)) = direct {
            return Some(vec![Some((key.as_str(), pair))]);
        }

        let parts: Vec<_> = diffusers_parts(module)?
            .iter()
            .map(|part| {
                self.pairs
                    .get_key_value(part)
                    .map(|(key, pair)| (key.as_str(), pair))
            })
            .collect();
        parts.iter().any(Option::is_some).then_some(parts)
    }

    /// Pairs that contribute to the Flux weight `weight_name`.
    pub fn modules_for(&self, weight_name: &str) -> Vec<&str> {
        weight_name
            .strip_suffix(".weight")
            .and_then(|module| self.resolve(module))
            .map(|parts| parts.into_iter().flatten().map(|(key, _)| key).collect())
            .unwrap_or_default()
    }

    /// Strength-1 delta for the Flux weight `weight_name` of shape `(out, in)`,
    /// or `None` when the adapter does not touch that weight.
    pub fn delta(
        &self,
        weight_name: &str,
        (out_features, in_features): (usize, usize),
    ) -> candle_core::Result<Option<Tensor>> {
        let Some(parts) = weight_name
            .strip_suffix(".weight")
            .and_then(|module| self.resolve(module))
        else {
            return Ok(None);
        };
        let Some(device) = parts
            .iter()
            .flatten()
            .next()
            .map(|(_, pair)| pair.down.device().clone())
        else {
            return Ok(None);
        };

        let rows = part_rows(parts.len(), out_features, in_features).ok_or_else(|| {
            candle_core::Error::Msg(format!(
                "cannot split {weight_name} of shape ({out_features}, {in_features}) into {} parts",
                parts.len()
            ))
        })?;
        let mut blocks = Vec::with_capacity(parts.len());
        for (part, rows) in parts.into_iter().zip(rows) {
            let block = match part {
                Some((_, pair)) => pair.delta()?,
                None => Tensor::zeros((rows, in_features), DType::F32, &device)?,
            };
            check_dims(weight_name, &block, (rows, in_features))?;
            blocks.push(block);
        }
        if blocks.len() == 1 {
            return Ok(blocks.pop());
        }
        Ok(Some(Tensor::cat(&blocks, 0)?))
    }
}

fn check_dims(
    weight_name: &str,
    delta: &Tensor,
    expected: (usize, usize),
) -> candle_core::Result<()> {
    let got = delta.dims2()?;
    if got != expected {
        candle_core::bail!("LoRA delta for {weight_name} has shape {got:?}, expected {expected:?}");
    }
    Ok(())
}

fn view_to_tensor(view: &TensorView<'_>, device: &Device) -> Result<Tensor> {
    let dtype = match view.dtype() {
        Dtype::F32 => DType::F32,
        Dtype::F16 => DType::F16,
        Dtype::BF16 => DType::BF16,
        other => anyhow::bail!("unsupported LoRA tensor dtype {other:?}"),
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?)
}

fn strip_prefix(key: &str) -> &str {
    KEY_PREFIXES
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix))
        .unwrap_or(key)
}

fn strip_any_suffix<'a>(key: &'a str, suffixes: &[&str]) -> Option<&'a str> {
    suffixes.iter().find_map(|suffix| key.strip_suffix(suffix))
}

/// `double_blocks.0.img_attn.qkv` -> `lora_unet_double_blocks_0_img_attn_qkv`
fn kohya_key(module: &str) -> String {
    format!("lora_unet_{}", module.replace('.', "_"))
}

/// Diffusers modules whose deltas, stacked by rows, make up the Flux `module`.
fn diffusers_parts(module: &str) -> Option<Vec<String>> {
    let (kind, rest) = module.split_once('.')?;
    let (index, layer) = rest.split_once('.')?;
    index.parse::<usize>().ok()?;

    let (block, names) = match (kind, layer) {
        ("double_blocks", "img_attn.qkv") => (
            "transformer_blocks",
            &["attn.to_q", "attn.to_k", "attn.to_v"][..],
        ),
        ("double_blocks", "txt_attn.qkv") => (
            "transformer_blocks",
            &["attn.add_q_proj", "attn.add_k_proj", "attn.add_v_proj"][..],
        ),
        ("double_blocks", "img_attn.proj") => ("transformer_blocks", &["attn.to_out.0"][..]),
        ("double_blocks", "txt_attn.proj") => ("transformer_blocks", &["attn.to_add_out"][..]),
        ("double_blocks", "img_mlp.0") => ("transformer_blocks", &["ff.net.0.proj"][..]),
        ("double_blocks", "img_mlp.2") => ("transformer_blocks", &["ff.net.2"][..]),
        ("double_blocks", "txt_mlp.0") => ("transformer_blocks", &["ff_context.net.0.proj"][..]),
        ("double_blocks", "txt_mlp.2") => ("transformer_blocks", &["ff_context.net.2"][..]),
        ("double_blocks", "img_mod.lin") => ("transformer_blocks", &["norm1.linear"][..]),
        ("double_blocks", "txt_mod.lin") => ("transformer_blocks", &["norm1_context.linear"][..]),
        ("single_blocks", "linear1") => (
            "single_transformer_blocks",
            &["attn.to_q", "attn.to_k", "attn.to_v", "proj_mlp"][..],
        ),
        ("single_blocks", "linear2") => ("single_transformer_blocks", &["proj_out"][..]),
        ("single_blocks", "modulation.lin") => ("single_transformer_blocks", &["norm.linear"][..]),
        _ => return None,
    };
    Some(
        names
            .iter()
            .map(|name| format!("{block}.{index}.{name}"))
            .collect(),
    )
}

/// Output rows owned by each part of a fused layer.
fn part_rows(parts: usize, out_features: usize, in_features: usize) -> Option<Vec<usize>> {
    match parts {
        1 => Some(vec![out_features]),
        // q, k, v
        3 if out_features % 3 == 0 => Some(vec![out_features / 3; 3]),
        // q, k, v, mlp of a single block; the attention parts are hidden-sized.
        4 if out_features > 3 * in_features => Some(vec![
            in_features,
            in_features,
            in_features,
            out_features - 3 * in_features,
        ]),
        _ => None,
    }
}

/// What a [`LoraFusedWeights`] backend applied, readable after the backend
/// has been moved into a `VarBuilder`.
#[derive(Debug, Default)]
pub struct FusionStats {
    layers: AtomicUsize,
    modules: Mutex<HashSet<String>>,
}

impl FusionStats {
    /// Number of model weights the adapter matched.
    pub fn layers(&self) -> usize {
        self.layers.load(Ordering::Relaxed)
    }

    fn record(&self, modules: &[&str]) {
        self.layers.fetch_add(1, Ordering::Relaxed);
        let mut used = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        used.extend(modules.iter().map(|module| module.to_string()));
    }

    /// Fails when the adapter matched no weight at all, and warns about pairs
    /// no weight asked for. Returns the number of matched weights.
    pub fn check(&self, adapter: &LoraAdapter) -> Result<usize> {
        let names = adapter.module_names();
        let layers = self.layers();
        if layers == 0 {
            anyhow::bail!(
                "LoRA adapter `{}` matched none of the model's layers ({} pairs, e.g. {})",
                adapter.name,
                names.len(),
                sample(&names)
            );
        }

        let used = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        let unused: Vec<&str> = names
            .into_iter()
            .filter(|name| !used.contains(*name))
            .collect();
        if !unused.is_empty() {
            warn!(
                adapter = %adapter.name,
                unused = unused.len(),
                sample = %sample(&unused),
                "LoRA pairs not applied to any layer"
            );
        }
        Ok(layers)
    }
}

fn sample(names: &[&str]) -> String {
    names.iter().take(3).copied().collect::<Vec<_>>().join(", ")
}

/// Weight source for the Flux transformer that adds the adapter's deltas,
/// scaled by `scale`, to the base checkpoint as tensors are requested.
pub struct LoraFusedWeights {
    base: MmapedSafetensors,
    adapter: Option<Arc<LoraAdapter>>,
    scale: f64,
    stats: Arc<FusionStats>,
}

impl LoraFusedWeights {
    pub fn new(base: MmapedSafetensors, adapter: Option<Arc<LoraAdapter>>, scale: f64) -> Self {
        Self {
            base,
            adapter,
            scale,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> Arc<FusionStats> {
        self.stats.clone()
    }
}

impl SimpleBackend for LoraFusedWeights {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _: candle_nn::Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        let tensor = self.get_unchecked(name, dtype, dev)?;
        if tensor.shape() != &s {
            Err(candle_core::Error::UnexpectedShape {
                msg: format!("shape mismatch for {name}"),
                expected: s,
                got: tensor.shape().clone(),
            }
            .bt())?
        }
        Ok(tensor)
    }

    fn get_unchecked(&self, name: &str, dtype: DType, dev: &Device) -> candle_core::Result<Tensor> {
        let base = self.base.load(name, dev)?;
        let adapter = match &self.adapter {
            Some(adapter) if base.rank() == 2 => adapter,
            _ => return base.to_dtype(dtype),
        };
        let modules = adapter.modules_for(name);
        if modules.is_empty() {
            return base.to_dtype(dtype);
        }
        self.stats.record(&modules);
        // A zero scale still counts as matched, the weight is just unchanged.
        if self.scale == 0.0 {
            return base.to_dtype(dtype);
        }
        match adapter.delta(name, base.dims2()?)? {
            Some(delta) => {
                let delta = (delta.to_device(dev)? * self.scale)?;
                (base.to_dtype(DType::F32)? + delta)?.to_dtype(dtype)
            }
            None => base.to_dtype(dtype),
        }
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.base.get(name).is_ok()
    }
}
