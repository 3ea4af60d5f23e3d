use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::GenerationParams;

/// Trigger word the bundled adapter was trained on.
pub const DEFAULT_TRIGGER_TOKEN: &str = "GN";

/// Largest seed the UI can submit or the builder can draw.
pub const MAX_SEED: u32 = u32::MAX;

/// Raw field values as submitted by the UI form.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationFields {
    pub prompt: String,
    #[serde(alias = "cfg_scale")]
    pub guidance_scale: f64,
    pub steps: usize,
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub randomize_seed: bool,
    #[serde(default)]
    pub seed: u32,
    #[serde(alias = "lora_scale")]
    pub adapter_scale: f64,
}

/// A single, fully resolved generation request. Built per interaction and
/// consumed once.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub trigger_token: String,
    pub guidance_scale: f64,
    pub steps: usize,
    pub width: usize,
    pub height: usize,
    pub seed: u32,
    pub randomize_seed: bool,
    pub adapter_scale: f64,
}

impl GenerationRequest {
    /// The prompt actually sent to the generator. The trigger token is always
    /// appended, even when the prompt already contains it.
    pub fn resolved_prompt(&self) -> String {
        format!("{} {}", self.prompt, self.trigger_token)
    }

    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            prompt: self.resolved_prompt(),
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            width: self.width,
            height: self.height,
            adapter_scale: self.adapter_scale,
        }
    }
}

/// Turns UI field values into [`GenerationRequest`]s.
///
/// Ranges are not re-checked here; the form layer owns input constraints.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    trigger_token: String,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TRIGGER_TOKEN)
    }
}

impl RequestBuilder {
    pub fn new(trigger_token: impl Into<String>) -> Self {
        Self {
            trigger_token: trigger_token.into(),
        }
    }

    pub fn trigger_token(&self) -> &str {
        &self.trigger_token
    }

    pub fn build(&self, fields: GenerationFields) -> GenerationRequest {
        self.build_with_rng(fields, &mut rand::thread_rng())
    }

    /// Like [`RequestBuilder::build`], drawing a randomized seed from `rng`.
    pub fn build_with_rng<R: Rng + ?Sized>(
        &self,
        fields: GenerationFields,
        rng: &mut R,
    ) -> GenerationRequest {
        let seed = if fields.randomize_seed {
            rng.gen_range(0..=MAX_SEED)
        } else {
            fields.seed
        };
        GenerationRequest {
            prompt: fields.prompt,
            trigger_token: self.trigger_token.clone(),
            guidance_scale: fields.guidance_scale,
            steps: fields.steps,
            width: fields.width,
            height: fields.height,
            seed,
            randomize_seed: fields.randomize_seed,
            adapter_scale: fields.adapter_scale,
        }
    }
}
