use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Error, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
        sampling, WithForward,
    },
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::{Api, ApiRepo};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, info};

pub mod lora;

use crate::{
    select_best_device, tensor_to_image, DeviceMap, GenerationParams, ImageGenerator, Loader,
    ProgressTracker,
};
use lora::{LoraAdapter, LoraFusedWeights};

const CLIP_MAX_TOKENS: usize = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    fn transformer_config(self) -> model::Config {
        match self {
            Self::Schnell => model::Config::schnell(),
            Self::Dev => model::Config::dev(),
        }
    }

    fn autoencoder_config(self) -> autoencoder::Config {
        match self {
            Self::Schnell => autoencoder::Config::schnell(),
            Self::Dev => autoencoder::Config::dev(),
        }
    }

    fn weight_file(self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    fn t5_max_tokens(self) -> usize {
        match self {
            Self::Schnell => 256,
            Self::Dev => 512,
        }
    }

    /// Timesteps from 1 to 0; dev shifts them towards the noisy end for
    /// larger images.
    fn schedule(self, steps: usize, image_seq_len: usize) -> Vec<f64> {
        match self {
            Self::Schnell => sampling::get_schedule(steps, None),
            Self::Dev => sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
        }
    }
}

/// Where to fetch a LoRA adapter from.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraSource {
    /// Hub repository id, e.g. `parth29vc/shm-v2`.
    pub repo: String,
    /// File inside the repository. When unset the repository must contain a
    /// single `.safetensors` file.
    pub weight_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FluxConfig {
    /// Hub repository holding the transformer and autoencoder weights.
    pub model_id: String,
    pub variant: FluxVariant,
    pub lora: Option<LoraSource>,
    /// Adapter scale fused at load time, so the first request at this scale
    /// does not rebuild the transformer.
    pub initial_adapter_scale: f64,
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_weights: PathBuf,
    lora: Option<Arc<LoraAdapter>>,
    flux_model: Option<Flux>,
    fused_scale: f64,
}

impl FluxModel {
    fn encode_t5(&mut self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(self.variant.t5_max_tokens(), 0);
        let input_token_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.t5_model.forward(&input_token_ids)?)
    }

    fn encode_clip(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        // Keep the end-of-text token, it is where the pooled embedding is read.
        if tokens.len() > CLIP_MAX_TOKENS {
            let eos = tokens[tokens.len() - 1];
            tokens.truncate(CLIP_MAX_TOKENS - 1);
            tokens.push(eos);
        }
        let input_token_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&input_token_ids)?)
    }

    /// Makes sure the loaded transformer has the adapter fused at `scale`.
    fn transformer(&mut self, scale: f64) -> Result<&Flux> {
        if needs_rebuild(
            self.lora.is_some(),
            self.flux_model.is_some(),
            self.fused_scale,
            scale,
        ) {
            // Release the old weights before mapping the new ones.
            self.flux_model = None;
            self.flux_model = Some(build_transformer(
                &self.flux_weights,
                self.variant,
                self.lora.clone(),
                scale,
                self.dtype,
                &self.device,
            )?);
            self.fused_scale = scale;
        }
        self.flux_model
            .as_ref()
            .context("flux transformer is not loaded")
    }
}

impl ImageGenerator for FluxModel {
    fn generate(
        &mut self,
        params: &GenerationParams,
        rng: &mut StdRng,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<DynamicImage> {
        let (width, height) = (params.width, params.height);

        let noise_img = seeded_noise(rng, height, width, &self.device)?.to_dtype(self.dtype)?;

        let t5_emb = self.encode_t5(&params.prompt)?;
        debug!(shape = ?t5_emb.dims(), "T5 embedding");
        let clip_emb = self.encode_clip(&params.prompt)?;
        debug!(shape = ?clip_emb.dims(), "CLIP embedding");

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = self.variant.schedule(params.steps, state.img.dim(1)?);

        let transformer = self.transformer(params.adapter_scale)?;
        let latent_img = denoise(transformer, &state, &timesteps, params.guidance_scale, progress)?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        info!("Generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        info!("Decoded image");

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

/// Whether the transformer must be (re)built to serve `requested`. Without an
/// adapter the scale has no effect on the weights.
fn needs_rebuild(has_lora: bool, loaded: bool, fused_scale: f64, requested: f64) -> bool {
    !loaded || (has_lora && fused_scale != requested)
}

/// Initial latent noise, drawn on the CPU from the seeded rng so a seed gives
/// the same noise on every device.
fn seeded_noise(rng: &mut StdRng, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let height = height.div_ceil(16) * 2;
    let width = width.div_ceil(16) * 2;
    let values: Vec<f32> = (0..16 * height * width)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, (1, 16, height, width), &Device::Cpu)?.to_device(device)?)
}

/// Euler sampling over `timesteps`, reporting each finished step.
fn denoise<M: WithForward>(
    model: &M,
    state: &sampling::State,
    timesteps: &[f64],
    guidance: f64,
    progress: &mut ProgressTracker<'_>,
) -> Result<Tensor> {
    let b_sz = state.img.dim(0)?;
    let dev = state.img.device();
    let guidance = Tensor::full(guidance as f32, b_sz, dev)?;
    let mut img = state.img.clone();
    for (step, window) in timesteps.windows(2).enumerate() {
        let (t_curr, t_prev) = (window[0], window[1]);
        let t_vec = Tensor::full(t_curr as f32, b_sz, dev)?;
        let pred = model.forward(
            &img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &t_vec,
            &state.vec,
            Some(&guidance),
        )?;
        img = (img + (pred * (t_prev - t_curr))?)?;
        progress.step(step + 1);
    }
    Ok(img)
}

fn build_transformer(
    weights: &Path,
    variant: FluxVariant,
    lora: Option<Arc<LoraAdapter>>,
    scale: f64,
    dtype: DType,
    device: &Device,
) -> Result<Flux> {
    let base = unsafe {
        MmapedSafetensors::new(weights).context("failed to map flux model file")?
    };
    let backend = LoraFusedWeights::new(base, lora.clone(), scale);
    let stats = backend.stats();
    let vb = VarBuilder::from_backend(Box::new(backend), dtype, device.clone());
    let flux_model =
        Flux::new(&variant.transformer_config(), vb).context("failed to load flux model")?;
    if let Some(adapter) = &lora {
        let layers = stats.check(adapter)?;
        info!(
            adapter = %adapter.name,
            adapter_scale = scale,
            fused_layers = layers,
            "Fused LoRA adapter into flux model"
        );
    }
    Ok(flux_model)
}

/// Picks the adapter weight file from a repository listing.
fn pick_lora_file<'a>(filenames: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let candidates: Vec<&str> = filenames
        .into_iter()
        .filter(|name| name.ends_with(".safetensors"))
        .collect();
    match candidates.as_slice() {
        [single] => Ok(single.to_string()),
        [] => anyhow::bail!("no .safetensors file found in LoRA repository"),
        many => anyhow::bail!(
            "LoRA repository has several .safetensors files ({}), pick one with a weight name",
            many.join(", ")
        ),
    }
}

async fn fetch_lora(api: &Api, source: &LoraSource, device: &Device) -> Result<LoraAdapter> {
    let repo = api.model(source.repo.clone());
    let weight_name = match &source.weight_name {
        Some(name) => name.clone(),
        None => {
            let info = repo
                .info()
                .await
                .with_context(|| format!("failed to list LoRA repository {}", source.repo))?;
            pick_lora_file(info.siblings.iter().map(|s| s.rfilename.as_str()))?
        }
    };
    let path = repo
        .get(&weight_name)
        .await
        .with_context(|| format!("failed to get LoRA weights {}/{weight_name}", source.repo))?;
    LoraAdapter::load(path, device)
}

async fn fetch_tokenizer(repo: &ApiRepo, file: &str) -> Result<Tokenizer> {
    let filename = repo
        .get(file)
        .await
        .with_context(|| format!("failed to get tokenizer {file}"))?;
    Tokenizer::from_file(filename)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("failed to load tokenizer {file}"))
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Config = FluxConfig;
    type Model = FluxModel;

    async fn load(config: FluxConfig, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let variant = config.variant;
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        info!(model = %config.model_id, ?variant, ?device, ?dtype, "Loading flux pipeline");

        // --- T5 ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = fetch_tokenizer(
            &api.model("lmz/mt5-tokenizers".to_string()),
            "t5-v1_1-xxl.tokenizer.json",
        )
        .await?;
        info!("Loaded T5 encoder");

        // --- CLIP ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: CLIP_MAX_TOKENS,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = fetch_tokenizer(&clip_repo, "tokenizer.json").await?;
        info!("Loaded CLIP encoder");

        // --- Autoencoder ---
        let bf_repo = api.repo(hf_hub::Repo::model(config.model_id.clone()));
        let autoencoder_model_file = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[autoencoder_model_file], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;
        info!("Loaded autoencoder");

        // --- LoRA + Flux ---
        let lora = match &config.lora {
            Some(source) => Some(Arc::new(fetch_lora(&api, source, &device).await?)),
            None => None,
        };
        let flux_weights = bf_repo
            .get(variant.weight_file())
            .await
            .context("failed to get flux model file")?;
        let flux_model = build_transformer(
            &flux_weights,
            variant,
            lora.clone(),
            config.initial_adapter_scale,
            dtype,
            &device,
        )?;
        info!("Loaded flux transformer");

        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_weights,
            lora,
            flux_model: Some(flux_model),
            fused_scale: config.initial_adapter_scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProgressUpdate;
    use rand::SeedableRng;

    /// Predicts a constant velocity of one.
    struct ConstantVelocity;

    impl WithForward for ConstantVelocity {
        #[allow(clippy::too_many_arguments)]
        fn forward(
            &self,
            img: &Tensor,
            _img_ids: &Tensor,
            _txt: &Tensor,
            _txt_ids: &Tensor,
            _timesteps: &Tensor,
            _y: &Tensor,
            _guidance: Option<&Tensor>,
        ) -> candle_core::Result<Tensor> {
            img.ones_like()
        }
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let a = seeded_noise(&mut StdRng::seed_from_u64(3981632454), 896, 1152, &Device::Cpu)
            .unwrap();
        let b = seeded_noise(&mut StdRng::seed_from_u64(3981632454), 896, 1152, &Device::Cpu)
            .unwrap();
        let c = seeded_noise(&mut StdRng::seed_from_u64(1), 896, 1152, &Device::Cpu).unwrap();

        assert_eq!(a.dims(), &[1, 16, 112, 144]);
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_seeded_noise_rounds_up_odd_sizes() {
        let noise = seeded_noise(&mut StdRng::seed_from_u64(0), 250, 260, &Device::Cpu).unwrap();
        assert_eq!(noise.dims(), &[1, 16, 32, 34]);
    }

    #[test]
    fn test_denoise_reports_every_step() {
        let t5_emb = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
        let clip_emb = Tensor::zeros((1, 8), DType::F32, &Device::Cpu).unwrap();
        let noise = Tensor::zeros((1, 16, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let state = sampling::State::new(&t5_emb, &clip_emb, &noise).unwrap();

        let timesteps = FluxVariant::Schnell.schedule(4, state.img.dim(1).unwrap());
        assert_eq!(timesteps.len(), 5);

        let mut updates = Vec::new();
        let mut observer = |update: ProgressUpdate| updates.push(update);
        let mut progress = ProgressTracker::new(4, &mut observer);
        let img = denoise(&ConstantVelocity, &state, &timesteps, 3.5, &mut progress).unwrap();
        drop(progress);

        // Timesteps run from 1 to 0, so a unit velocity moves every value by -1.
        let values = img.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v + 1.0).abs() < 1e-5), "{values:?}");
        let percents: Vec<f64> = updates.iter().map(|u| u.percent).collect();
        assert_eq!(percents, vec![25.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn test_variant_settings() {
        assert_eq!(FluxVariant::Dev.weight_file(), "flux1-dev.safetensors");
        assert_eq!(FluxVariant::Schnell.weight_file(), "flux1-schnell.safetensors");
        assert_eq!(FluxVariant::Dev.t5_max_tokens(), 512);
        assert_eq!(FluxVariant::Schnell.t5_max_tokens(), 256);

        let schedule = FluxVariant::Dev.schedule(32, 4032);
        assert_eq!(schedule.len(), 33);
        assert_eq!(schedule.first(), Some(&1.0));
        assert_eq!(schedule.last(), Some(&0.0));
        assert!(schedule.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_needs_rebuild() {
        // Same scale reuses the fused weights.
        assert!(!needs_rebuild(true, true, 0.85, 0.85));
        // A new scale has to be fused again.
        assert!(needs_rebuild(true, true, 0.85, 0.5));
        assert!(needs_rebuild(true, true, 0.85, 0.0));
        // Without an adapter the scale is irrelevant.
        assert!(!needs_rebuild(false, true, 0.85, 0.5));
        // Nothing loaded yet.
        assert!(needs_rebuild(false, false, 0.85, 0.85));
        assert!(needs_rebuild(true, false, 0.85, 0.85));
    }

    #[test]
    fn test_pick_lora_file() {
        assert_eq!(
            pick_lora_file(["README.md", "lora.safetensors", "samples/a.jpg"]).unwrap(),
            "lora.safetensors"
        );
        assert!(pick_lora_file(["README.md"]).is_err());
        let err = pick_lora_file(["a.safetensors", "b.safetensors"]).unwrap_err();
        assert!(err.to_string().contains("a.safetensors, b.safetensors"));
    }
}
