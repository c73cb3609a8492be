//! Generation endpoint

use crate::api::AppState;
use crate::api::generate::schemas::{GenerateQuery, GenerateReply};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use uuid::Uuid;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(generate))
}

/// Runs one query against the model and returns the reply for display.
///
/// Generation faults are already rendered into the reply string by the query
/// service, so this endpoint only fails on malformed requests.
async fn generate(
    State(state): State<AppState>,
    Json(query): Json<GenerateQuery>,
) -> (StatusCode, Json<GenerateReply>) {
    let reply = state.query_service.reply(&query.text).await;

    (
        StatusCode::OK,
        Json(GenerateReply {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            reply,
        }),
    )
}

pub mod schemas {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Deserialize, Debug)]
    pub struct GenerateQuery {
        pub text: String,
    }

    #[derive(Serialize, Debug)]
    pub struct GenerateReply {
        pub id: Uuid,
        pub created_at: DateTime<Utc>,
        pub reply: String,
    }
}
