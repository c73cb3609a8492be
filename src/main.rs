//! Single-turn playground web server for a local LLM
//!

use local_llm_playground::api;
use local_llm_playground::api::AppState;
use local_llm_playground::core;
use local_llm_playground::core::pipeline::{GenerationRequest, ModelConfig};
use local_llm_playground::core::services::{ChannelTextGenerator, PlaygroundQueryService};
use local_llm_playground::core::traits::TextGenerator;

use axum::http::{HeaderValue, Method};
use axum::response::Html;
use axum::{Router, routing::get};
use log::info;
use std::env;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;

    // background task that owns the model
    let (request_sender, request_receiver) = mpsc::channel(16);
    let pipeline_join_handle = runtime.spawn(core::pipeline::background_task(
        request_receiver,
        ModelConfig::from_env(),
    ));

    let web_task_handle = runtime.spawn(web_server_task(request_sender));

    runtime.block_on(async {
        web_task_handle
            .await
            .expect("failed to join web_task_handle");
        pipeline_join_handle
            .await
            .expect("failed to join pipeline_join_handle");
    });

    Ok(())
}

async fn web_server_task(request_sender: mpsc::Sender<GenerationRequest>) {
    let generator: Arc<dyn TextGenerator> = Arc::new(ChannelTextGenerator::new(request_sender));
    let state = AppState::new(Arc::new(PlaygroundQueryService::new(generator)));

    // build our application with a route
    let app = Router::new()
        .route("/", get(index))
        .nest_service(
            "/static",
            ServiceBuilder::new().service(ServeDir::new("static")),
        )
        .nest("/generate", api::generate::router())
        .layer(
            CorsLayer::new()
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_origin([
                    "http://localhost:3000".parse::<HeaderValue>().unwrap(),
                    "http://localhost:5173".parse::<HeaderValue>().unwrap(),
                ]),
        )
        .with_state(state);

    let addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_owned());
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap();
    info!("Shutting down...");
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}
