use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pre-rendered example image could not be read at start-up.
    #[error("failed to load example image `{}`", path.display())]
    ExampleAsset {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The generator failed; the request is dropped without retry.
    #[error("image generation failed")]
    Generation(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
