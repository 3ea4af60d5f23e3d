use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, ImageGenerator};

/// Explicit initialization step for a generator backend. Everything the model
/// needs is fetched and built here, once, before the server starts.
pub trait Loader {
    type Config;
    type Model: ImageGenerator;

    fn load(
        config: Self::Config,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
