use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde::Serialize;

use crate::{Error, GenerationFields, Result};

pub const EXAMPLE_IMAGE_PATH: &str = "samples/samples_1725343907682__000001000_1.jpg";

pub const EXAMPLE_PROMPT: &str = "a digital art, an old GN walking in a jungle with his friend \
bhai mardana who plays  a simple stringed instrument, such as a rabab (a precursor to the sarangi)";

/// Configuration the UI is populated with on first load, together with the
/// image it was rendered to.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ExampleConfig {
    pub fields: GenerationFields,
    #[serde(skip)]
    pub image_path: PathBuf,
}

impl Default for ExampleConfig {
    fn default() -> Self {
        Self {
            fields: GenerationFields {
                prompt: EXAMPLE_PROMPT.to_string(),
                guidance_scale: 3.2,
                steps: 32,
                width: 1152,
                height: 896,
                randomize_seed: false,
                seed: 3981632454,
                adapter_scale: 0.85,
            },
            image_path: PathBuf::from(EXAMPLE_IMAGE_PATH),
        }
    }
}

impl ExampleConfig {
    pub fn with_image_path(mut self, path: impl AsRef<Path>) -> Self {
        self.image_path = path.as_ref().to_path_buf();
        self
    }

    /// Reads the pre-rendered example image.
    pub fn load_image(&self) -> Result<DynamicImage> {
        image::open(&self.image_path).map_err(|source| Error::ExampleAsset {
            path: self.image_path.clone(),
            source,
        })
    }
}
