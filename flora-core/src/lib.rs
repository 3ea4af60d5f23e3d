pub mod adapter;
pub mod device_map;
pub mod error;
pub mod example;
pub mod loader;
mod loader_factory;
pub mod progress;
pub mod request;
mod util;

mod flux;

pub use adapter::*;
pub use device_map::*;
pub use error::{Error, Result};
pub use example::ExampleConfig;
pub use flux::lora::LoraAdapter;
pub use flux::{FluxConfig, FluxLoader, FluxModel, FluxVariant, LoraSource};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use progress::{LogProgress, ProgressObserver, ProgressTracker, ProgressUpdate};
use rand::rngs::StdRng;
pub use request::*;
pub(crate) use util::*;

/// Parameters handed to an [`ImageGenerator`] for a single call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Prompt with the trigger token already appended.
    pub prompt: String,
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    /// Scale factor applied to the LoRA adapter's contribution.
    pub adapter_scale: f64,
}

/// The external generation capability.
///
/// Implementations draw all their randomness from `rng` so that a fixed seed
/// reproduces the same image, and may report denoising steps to `progress`.
pub trait ImageGenerator: Send {
    fn generate(
        &mut self,
        params: &GenerationParams,
        rng: &mut StdRng,
        progress: &mut ProgressTracker<'_>,
    ) -> anyhow::Result<DynamicImage>;
}

impl<G: ImageGenerator + ?Sized> ImageGenerator for Box<G> {
    fn generate(
        &mut self,
        params: &GenerationParams,
        rng: &mut StdRng,
        progress: &mut ProgressTracker<'_>,
    ) -> anyhow::Result<DynamicImage> {
        (**self).generate(params, rng, progress)
    }
}
