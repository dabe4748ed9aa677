//! Health, metadata, tokenisation, embedding, rerank, slot and adapter
//! endpoints

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, ServerError};
use crate::routes::completion::{collect_final, parse_params};
use crate::state::AppState;
use crate::task::{CompletionMode, CompletionTask, LoraAdapter, TaskPayload};

/// `GET /health`
pub async fn handle_health(State(state): State<AppState>) -> Response {
    if !state.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "loading model"})),
        )
            .into_response();
    }

    let idle = state
        .scheduler
        .idle_slots
        .load(std::sync::atomic::Ordering::SeqCst);
    Json(json!({
        "status": "ok",
        "slots_idle": idle,
        "slots_processing": state.scheduler.total_slots - idle,
    }))
    .into_response()
}

/// `GET /v1/models`
pub async fn handle_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.config.model_alias,
            "object": "model",
            "owned_by": "ringlm",
        }],
    }))
}

/// `GET /props`
pub async fn handle_props(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "system_prompt": state.config.system_prompt,
        "total_slots": state.scheduler.total_slots,
        "default_generation_settings": {
            "n_ctx": state.config.n_ctx_slot,
            "n_predict": state.config.n_predict,
        },
        "chat_template": "",
    }))
}

/// `GET /metrics`
pub async fn handle_metrics(State(state): State<AppState>) -> Result<Response> {
    if !state.config.metrics {
        return Err(ServerError::not_supported(
            "metrics are disabled, start with --metrics",
        ));
    }

    let (_, rx) = state.scheduler.submit(TaskPayload::Metrics);
    let data = collect_final(rx).await?;

    // render the scheduler's snapshot as a Prometheus exposition
    let metrics = crate::metrics::ServerMetrics {
        n_prompt_tokens_processed_total: data["n_prompt_tokens_processed_total"]
            .as_u64()
            .unwrap_or(0),
        t_prompt_processing_total_ms: data["t_prompt_processing_total"].as_f64().unwrap_or(0.0),
        n_tokens_predicted_total: data["n_tokens_predicted_total"].as_u64().unwrap_or(0),
        t_tokens_generation_total_ms: data["t_tokens_generation_total"].as_f64().unwrap_or(0.0),
        n_prompt_tokens_processed: data["n_prompt_tokens_processed"].as_u64().unwrap_or(0),
        t_prompt_processing_ms: data["t_prompt_processing"].as_f64().unwrap_or(0.0),
        n_tokens_predicted: data["n_tokens_predicted"].as_u64().unwrap_or(0),
        t_tokens_generation_ms: data["t_tokens_generation"].as_f64().unwrap_or(0.0),
        n_decode_total: data["n_decode_total"].as_u64().unwrap_or(0),
        n_busy_slots_total: data["n_busy_slots_total"].as_u64().unwrap_or(0),
        ..Default::default()
    };
    let body = metrics.render_prometheus(
        data["idle"].as_u64().unwrap_or(0) as usize,
        data["processing"].as_u64().unwrap_or(0) as usize,
        0,
    );

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

/// `GET /slots`
pub async fn handle_slots(State(state): State<AppState>) -> Result<Json<Value>> {
    let (_, rx) = state.scheduler.submit(TaskPayload::Metrics);
    let data = collect_final(rx).await?;
    Ok(Json(data["slots"].clone()))
}

#[derive(Deserialize)]
pub struct SlotActionQuery {
    action: String,
}

#[derive(Deserialize, Default)]
pub struct SlotActionBody {
    #[serde(default)]
    filename: Option<String>,
}

/// `POST /slots/{id}?action=save|restore|erase`
pub async fn handle_slot_action(
    State(state): State<AppState>,
    Path(slot_id): Path<usize>,
    Query(query): Query<SlotActionQuery>,
    body: Option<Json<SlotActionBody>>,
) -> Result<Json<Value>> {
    let filename = body
        .and_then(|Json(b)| b.filename)
        .unwrap_or_else(|| format!("slot-{slot_id}.rlkv"));

    let payload = match query.action.as_str() {
        "save" => TaskPayload::SlotSave { slot_id, filename },
        "restore" => TaskPayload::SlotRestore { slot_id, filename },
        "erase" => TaskPayload::SlotErase { slot_id },
        other => {
            return Err(ServerError::invalid(format!("unknown action '{other}'")));
        }
    };

    let (_, rx) = state.scheduler.submit(payload);
    Ok(Json(collect_final(rx).await?))
}

/// `POST /tokenize`
pub async fn handle_tokenize(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let content = body
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| ServerError::invalid("missing content"))?;
    let add_special = body
        .get("add_special")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let tokens = state.tokenizer.tokenize(content, add_special);
    Ok(Json(json!({ "tokens": tokens })))
}

/// `POST /detokenize`
pub async fn handle_detokenize(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let tokens: Vec<u32> = body
        .get("tokens")
        .and_then(Value::as_array)
        .ok_or_else(|| ServerError::invalid("missing tokens"))?
        .iter()
        .filter_map(Value::as_u64)
        .map(|t| t as u32)
        .collect();

    let bytes = state.tokenizer.detokenize(&tokens);
    Ok(Json(json!({
        "content": String::from_utf8_lossy(&bytes),
    })))
}

async fn embed_one(state: &AppState, input: Value) -> Result<Vec<f32>> {
    let task = CompletionTask {
        prompt: input,
        params: crate::task::SlotParams {
            n_predict: 0,
            ..Default::default()
        },
        mode: CompletionMode::Embedding,
    };
    let (_, rx) = state
        .scheduler
        .submit(TaskPayload::Completion(Box::new(task)));
    let data = collect_final(rx).await?;
    Ok(data["embedding"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_f64).map(|v| v as f32).collect())
        .unwrap_or_default())
}

/// `POST /embedding`, `POST /embeddings`
pub async fn handle_embedding(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    if !state.config.embedding {
        return Err(ServerError::not_supported(
            "embedding mode is disabled, start with --embedding",
        ));
    }
    let input = body
        .get("content")
        .or_else(|| body.get("input"))
        .or_else(|| body.get("prompt"))
        .cloned()
        .ok_or_else(|| ServerError::invalid("missing content"))?;

    let embedding = embed_one(&state, input).await?;
    Ok(Json(json!({ "embedding": embedding })))
}

/// `POST /v1/embeddings`
pub async fn handle_embedding_oai(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    if !state.config.embedding {
        return Err(ServerError::not_supported(
            "embedding mode is disabled, start with --embedding",
        ));
    }
    let inputs: Vec<Value> = match body.get("input") {
        Some(Value::Array(items)) => items.clone(),
        Some(single) => vec![single.clone()],
        None => return Err(ServerError::invalid("missing input")),
    };

    let mut data = Vec::new();
    for (i, input) in inputs.into_iter().enumerate() {
        let embedding = embed_one(&state, input).await?;
        data.push(json!({
            "object": "embedding",
            "index": i,
            "embedding": embedding,
        }));
    }

    Ok(Json(json!({
        "object": "list",
        "model": state.config.model_alias,
        "data": data,
    })))
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// `POST /rerank`, `POST /reranking`, `POST /v1/rerank`
pub async fn handle_rerank(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    if !state.config.rerank {
        return Err(ServerError::not_supported(
            "reranking is disabled, start with --rerank",
        ));
    }
    let query = body
        .get("query")
        .cloned()
        .ok_or_else(|| ServerError::invalid("missing query"))?;
    let documents = body
        .get("documents")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| ServerError::invalid("missing documents"))?;

    let query_embedding = embed_one(&state, query).await?;

    let mut results = Vec::new();
    for (index, document) in documents.into_iter().enumerate() {
        let doc_embedding = embed_one(&state, document).await?;
        results.push(json!({
            "index": index,
            "relevance_score": cosine(&query_embedding, &doc_embedding),
        }));
    }
    results.sort_by(|a, b| {
        b["relevance_score"]
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&a["relevance_score"].as_f64().unwrap_or(0.0))
    });

    Ok(Json(json!({
        "model": state.config.model_alias,
        "results": results,
    })))
}

/// `GET /lora-adapters`
pub async fn handle_lora_list(State(state): State<AppState>) -> Result<Json<Value>> {
    let adapters = state.scheduler.lora.lock().clone();
    Ok(Json(serde_json::to_value(adapters).unwrap_or(json!([]))))
}

/// `POST /lora-adapters`
pub async fn handle_lora_set(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let adapters: Vec<LoraAdapter> = serde_json::from_value(body)
        .map_err(|e| ServerError::invalid(format!("bad adapter list: {e}")))?;

    let (_, rx) = state.scheduler.submit(TaskPayload::SetLora { adapters });
    Ok(Json(collect_final(rx).await?))
}

/// `POST /v1/cancel`
pub async fn handle_cancel(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let target = body
        .get("task_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ServerError::invalid("missing task_id"))? as i32;

    let (_, rx) = state.scheduler.cancel(target);
    Ok(Json(collect_final(rx).await?))
}
