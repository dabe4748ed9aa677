//! HTTP routes
//!
//! The endpoint set of the completion server: completion and its OpenAI
//! aliases, infill, embedding, rerank, tokenisation, slot management,
//! LoRA adapters, health and metrics. Everything except `/health` and
//! `/v1/models` sits behind the bearer-key check when one is configured.

mod completion;
mod misc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};

use crate::error::ServerError;
use crate::state::AppState;

/// Build the full router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/completion", post(completion::handle_completion))
        .route("/v1/completions", post(completion::handle_completion))
        .route("/chat/completions", post(completion::handle_chat))
        .route("/v1/chat/completions", post(completion::handle_chat))
        .route("/infill", post(completion::handle_infill))
        .route("/embedding", post(misc::handle_embedding))
        .route("/embeddings", post(misc::handle_embedding))
        .route("/v1/embeddings", post(misc::handle_embedding_oai))
        .route("/rerank", post(misc::handle_rerank))
        .route("/reranking", post(misc::handle_rerank))
        .route("/v1/rerank", post(misc::handle_rerank))
        .route("/props", get(misc::handle_props))
        .route("/metrics", get(misc::handle_metrics))
        .route("/slots", get(misc::handle_slots))
        .route("/slots/:id", post(misc::handle_slot_action))
        .route("/tokenize", post(misc::handle_tokenize))
        .route("/detokenize", post(misc::handle_detokenize))
        .route(
            "/lora-adapters",
            get(misc::handle_lora_list).post(misc::handle_lora_set),
        )
        .route("/v1/cancel", post(misc::handle_cancel))
        .layer(middleware::from_fn_with_state(state.clone(), check_api_key));

    Router::new()
        .route("/health", get(misc::handle_health))
        .route("/v1/models", get(misc::handle_models))
        .merge(protected)
        .with_state(state)
}

/// Bearer-key middleware for the protected routes
async fn check_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let Some(expected) = &state.config.api_key else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(key) if key == expected => Ok(next.run(request).await),
        _ => Err(ServerError::Api {
            kind: crate::error::ErrorKind::Authentication,
            message: "invalid API key".into(),
        }),
    }
}
