use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DeviceMap, FluxConfig, FluxLoader, FluxVariant, ImageGenerator, Loader, LoraSource};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    Flux(FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("SCHNELL") {
                FluxVariant::Schnell
            } else {
                // Adapters are trained against dev, so that is the default.
                FluxVariant::Dev
            }))
        } else {
            None
        }
    }
}

/// Load a generator based on its model name, attaching the adapter if given.
pub async fn load_model(
    model_name: &str,
    lora: Option<LoraSource>,
    initial_adapter_scale: f64,
    api: Api,
    device_map: DeviceMap,
) -> Result<Box<dyn ImageGenerator>> {
    let model_variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model: {}", model_name))?;

    info!(model = model_name, variant = ?model_variant, ?device_map, "Loading model");

    match model_variant {
        ModelVariant::Flux(variant) => {
            let config = FluxConfig {
                model_id: model_name.to_string(),
                variant,
                lora,
                initial_adapter_scale,
            };
            let model = FluxLoader::load(config, api, device_map).await?;
            Ok(Box::new(model))
        }
    }
}
