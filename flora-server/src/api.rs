use std::{io::Cursor, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use flora_core::{
    GenerationFields, GenerationRequest, ImageGenerator, InferenceAdapter, LogProgress,
    ProgressObserver, ProgressUpdate, RequestBuilder,
};
use image::DynamicImage;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt};
use tracing::{error, info};

use crate::form::{self, FieldError, FormLimits, LIMITS};

type SharedAdapter = Arc<Mutex<InferenceAdapter<Box<dyn ImageGenerator>>>>;

/// Encodes an image as a base64 PNG.
fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Serialize, Debug, Clone)]
pub struct GenerationResponse {
    pub image: String,
    pub seed: u32,
}

#[derive(Serialize, Debug, Clone)]
pub struct ExampleResponse {
    pub fields: GenerationFields,
    pub image: String,
    pub trigger_token: String,
    pub limits: FormLimits,
}

#[derive(Serialize, Debug, Clone)]
struct ErrorBody {
    error: String,
}

// Application state containing the generator and the example the UI starts from.
pub struct AppState {
    /// Lock held for the whole generation; waiting requests queue on it.
    adapter: SharedAdapter,
    builder: RequestBuilder,
    example: ExampleResponse,
}

impl AppState {
    pub fn new(
        generator: Box<dyn ImageGenerator>,
        builder: RequestBuilder,
        example_fields: GenerationFields,
        example_image: &DynamicImage,
    ) -> Result<Self> {
        let example = ExampleResponse {
            fields: example_fields,
            image: image_to_base64_png(example_image)?,
            trigger_token: builder.trigger_token().to_string(),
            limits: LIMITS,
        };
        Ok(Self {
            adapter: Arc::new(Mutex::new(InferenceAdapter::new(generator))),
            builder,
            example,
        })
    }
}

pub enum ApiError {
    Form(FieldError),
    Generation(flora_core::Error),
    Internal(anyhow::Error),
}

impl From<FieldError> for ApiError {
    fn from(err: FieldError) -> Self {
        Self::Form(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Form(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Generation(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Form(err) => err.to_string(),
            Self::Generation(err) => {
                let mut message = err.to_string();
                let mut source = std::error::Error::source(err);
                while let Some(cause) = source {
                    message.push_str(": ");
                    message.push_str(&cause.to_string());
                    source = cause.source();
                }
                message
            }
            Self::Internal(err) => format!("{err:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody { error: self.message() })).into_response()
    }
}

enum StreamEvent {
    Progress(ProgressUpdate),
    Result(GenerationResponse),
    Error(ErrorBody),
}

impl StreamEvent {
    fn into_event(self) -> Result<Event, axum::Error> {
        match self {
            Self::Progress(update) => Event::default().event("progress").json_data(update),
            Self::Result(response) => Event::default().event("result").json_data(response),
            Self::Error(body) => Event::default().event("error").json_data(body),
        }
    }
}

/// Waits for the generator, then runs one request on a blocking thread.
async fn run_generation<O>(
    adapter: &SharedAdapter,
    request: GenerationRequest,
    mut observer: O,
) -> Result<GenerationResponse, ApiError>
where
    O: ProgressObserver + Send + 'static,
{
    let mut adapter = adapter.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || -> Result<GenerationResponse, ApiError> {
        let result = adapter
            .generate(&request, &mut observer)
            .map_err(ApiError::Generation)?;
        let image = image_to_base64_png(&result.image).map_err(ApiError::Internal)?;
        info!(seed = result.seed_used, "Generated image");
        Ok(GenerationResponse {
            image,
            seed: result.seed_used,
        })
    })
    .await
    .map_err(|err| ApiError::Internal(err.into()))?
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

async fn example_handler(State(state): State<Arc<AppState>>) -> Json<ExampleResponse> {
    Json(state.example.clone())
}

/// Generates one image, streaming progress as server-sent events.
async fn generate_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(fields): Json<GenerationFields>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    form::validate(&fields)?;
    let request = state.builder.build(fields);

    let (tx, rx) = mpsc::unbounded_channel();
    let progress_tx = tx.clone();
    let adapter = state.adapter.clone();
    tokio::spawn(async move {
        let observer = move |update: ProgressUpdate| {
            // A closed channel means the client went away; let the run finish.
            let _ = progress_tx.send(StreamEvent::Progress(update));
        };
        let event = match run_generation(&adapter, request, observer).await {
            Ok(response) => StreamEvent::Result(response),
            Err(err) => {
                error!("Error generating image: {}", err.message());
                StreamEvent::Error(ErrorBody {
                    error: err.message(),
                })
            }
        };
        let _ = tx.send(event);
    });

    let stream = UnboundedReceiverStream::new(rx).map(StreamEvent::into_event);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Generates one image and returns it with the seed used (base64 PNG).
async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(fields): Json<GenerationFields>,
) -> Result<Json<GenerationResponse>, ApiError> {
    form::validate(&fields)?;
    let request = state.builder.build(fields);
    match run_generation(&state.adapter, request, LogProgress).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            error!("Error generating image: {}", err.message());
            Err(err)
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/example", get(example_handler))
        .route("/api/generate", post(generate_stream_handler))
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flora_core::{ExampleConfig, GenerationParams, ProgressTracker};
    use image::{Rgb, RgbImage};
    use rand::{rngs::StdRng, Rng};
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    type Calls = Arc<StdMutex<Vec<GenerationParams>>>;

    struct StubGenerator {
        calls: Calls,
        fail: bool,
    }

    impl ImageGenerator for StubGenerator {
        fn generate(
            &mut self,
            params: &GenerationParams,
            rng: &mut StdRng,
            progress: &mut ProgressTracker<'_>,
        ) -> anyhow::Result<DynamicImage> {
            self.calls.lock().unwrap().push(params.clone());
            if self.fail {
                anyhow::bail!("out of memory");
            }
            for step in 1..=params.steps {
                progress.step(step);
            }
            let colour = Rgb([rng.gen(), rng.gen(), rng.gen()]);
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 4, colour)))
        }
    }

    async fn spawn_app(fail: bool) -> (String, Calls) {
        let calls = Calls::default();
        let generator = Box::new(StubGenerator {
            calls: calls.clone(),
            fail,
        });
        let example_image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])));
        let state = AppState::new(
            generator,
            RequestBuilder::default(),
            ExampleConfig::default().fields,
            &example_image,
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(Arc::new(state)).into_make_service())
                .await
                .unwrap();
        });
        (format!("http://{addr}"), calls)
    }

    fn example_body(prompt: &str) -> Value {
        json!({
            "prompt": prompt,
            "cfg_scale": 3.2,
            "steps": 32,
            "width": 1152,
            "height": 896,
            "randomize_seed": false,
            "seed": 3981632454u32,
            "lora_scale": 0.85,
        })
    }

    /// Splits an SSE body into `(event, data)` pairs.
    fn parse_sse(body: &str) -> Vec<(String, Value)> {
        body.split("\n\n")
            .filter_map(|chunk| {
                let mut event = None;
                let mut data = None;
                for line in chunk.lines() {
                    if let Some(name) = line.strip_prefix("event:") {
                        event = Some(name.trim().to_string());
                    } else if let Some(payload) = line.strip_prefix("data:") {
                        data = Some(serde_json::from_str(payload.trim()).unwrap());
                    }
                }
                Some((event?, data?))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_index_page() {
        let (base, _) = spawn_app(false).await;
        let body = reqwest::get(format!("{base}/")).await.unwrap().text().await.unwrap();
        assert!(body.contains("Flux RealismLora Image Generator"));
    }

    #[tokio::test]
    async fn test_example_is_served() {
        let (base, _) = spawn_app(false).await;
        let example: Value = reqwest::get(format!("{base}/api/example"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(example["fields"]["seed"], 3981632454u32);
        assert_eq!(example["fields"]["steps"], 32);
        assert_eq!(example["fields"]["guidance_scale"], 3.2);
        assert_eq!(example["fields"]["adapter_scale"], 0.85);
        assert_eq!(example["trigger_token"], "GN");
        assert_eq!(example["limits"]["width"]["step"], 64.0);

        let png = BASE64_STANDARD
            .decode(example["image"].as_str().unwrap())
            .unwrap();
        let image = image::load_from_memory(&png).unwrap();
        assert_eq!((image.width(), image.height()), (2, 2));
    }

    #[tokio::test]
    async fn test_generate_json() {
        let (base, calls) = spawn_app(false).await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/v1/images/generations"))
            .json(&example_body("a test scene"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["seed"], 3981632454u32);
        assert!(!body["image"].as_str().unwrap().is_empty());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].prompt, "a test scene GN");
        assert_eq!(calls[0].steps, 32);
        assert_eq!(calls[0].adapter_scale, 0.85);
    }

    #[tokio::test]
    async fn test_same_request_same_image() {
        let (base, _) = spawn_app(false).await;
        let client = reqwest::Client::new();
        let mut images = Vec::new();
        for _ in 0..2 {
            let body: Value = client
                .post(format!("{base}/v1/images/generations"))
                .json(&example_body("a test scene"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            images.push(body["image"].as_str().unwrap().to_string());
        }
        assert_eq!(images[0], images[1]);
    }

    #[tokio::test]
    async fn test_randomized_seed() {
        let (base, _) = spawn_app(false).await;
        let client = reqwest::Client::new();
        let mut body = example_body("p");
        body["randomize_seed"] = json!(true);
        body["seed"] = json!(0);

        let mut seeds = Vec::new();
        for _ in 0..3 {
            let response: Value = client
                .post(format!("{base}/v1/images/generations"))
                .json(&body)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            seeds.push(response["seed"].as_u64().unwrap());
        }
        seeds.dedup();
        assert!(seeds.len() > 1, "seeds should differ: {seeds:?}");
    }

    #[tokio::test]
    async fn test_invalid_fields_are_rejected() {
        let (base, calls) = spawn_app(false).await;
        let mut body = example_body("p");
        body["width"] = json!(1000);
        let response = reqwest::Client::new()
            .post(format!("{base}/v1/images/generations"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 422);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "width must be a multiple of 64, got 1000");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generate_stream() {
        let (base, _) = spawn_app(false).await;
        let mut body = example_body("a test scene");
        body["steps"] = json!(1);
        let text = reqwest::Client::new()
            .post(format!("{base}/api/generate"))
            .json(&body)
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let events = parse_sse(&text);

        let (last_event, last_data) = events.last().unwrap();
        assert_eq!(last_event, "result");
        assert_eq!(last_data["seed"], 3981632454u32);

        let percents: Vec<f64> = events
            .iter()
            .filter(|(event, _)| event == "progress")
            .map(|(_, data)| data["percent"].as_f64().unwrap())
            .collect();
        assert_eq!(percents.first(), Some(&0.0));
        assert_eq!(percents.last(), Some(&100.0));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    }

    #[tokio::test]
    async fn test_generator_failure() {
        let (base, calls) = spawn_app(true).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/v1/images/generations"))
            .json(&example_body("p"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("out of memory"));

        let text = client
            .post(format!("{base}/api/generate"))
            .json(&example_body("p"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let events = parse_sse(&text);
        let (last_event, last_data) = events.last().unwrap();
        assert_eq!(last_event, "error");
        assert!(last_data["error"].as_str().unwrap().contains("out of memory"));
        assert!(!events.iter().any(|(event, _)| event == "result"));

        // One call per request, no retries.
        assert_eq!(calls.lock().unwrap().len(), 2);
    }
}
