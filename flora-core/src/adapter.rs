use image::DynamicImage;
use rand::{rngs::StdRng, SeedableRng};
use tracing::info;

use crate::{Error, GenerationRequest, ImageGenerator, ProgressObserver, ProgressTracker, Result};

/// One generated image and the seed it was generated with.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: DynamicImage,
    pub seed_used: u32,
}

/// Forwards requests to an injected [`ImageGenerator`].
pub struct InferenceAdapter<G> {
    generator: G,
}

impl<G: ImageGenerator> InferenceAdapter<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// Runs the generator exactly once for `request`.
    ///
    /// The observer sees a 0% update first and, on success, a final 100%
    /// update. Generator failures are returned as [`Error::Generation`].
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        observer: &mut dyn ProgressObserver,
    ) -> Result<GenerationResult> {
        let params = request.params();
        info!(
            prompt = %params.prompt,
            steps = params.steps,
            guidance_scale = params.guidance_scale,
            size = format!("{}x{}", params.width, params.height),
            seed = request.seed,
            adapter_scale = params.adapter_scale,
            "Generating image"
        );

        let mut rng = StdRng::seed_from_u64(u64::from(request.seed));
        let mut progress = ProgressTracker::new(params.steps, observer);
        progress.start();

        let image = self
            .generator
            .generate(&params, &mut rng, &mut progress)
            .map_err(Error::Generation)?;

        progress.finish();
        Ok(GenerationResult {
            image,
            seed_used: request.seed,
        })
    }
}
