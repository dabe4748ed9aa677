//! Completion, chat and infill handlers

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::Stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;

use crate::error::{Result, ServerError};
use crate::sampler::SamplingParams;
use crate::scheduler::SchedulerHandle;
use crate::state::AppState;
use crate::task::{CompletionMode, CompletionTask, SlotParams, SpeculativeParams, TaskPayload};

/// A byte-allowlist standing in for schema-constrained output: the
/// characters a JSON document can be built from
const JSON_CHARSET: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 \
     {}[]\",.:+-_eE\\/\n\t";

/// Parse the shared completion parameters out of a request body
pub(crate) fn parse_params(body: &Value, state: &AppState) -> Result<SlotParams> {
    if body.get("json_schema").is_some() && body.get("grammar").is_some() {
        return Err(ServerError::invalid(
            "either json_schema or grammar can be specified, not both",
        ));
    }

    let defaults = SamplingParams::default();
    let mut sampling = SamplingParams::from_json(body, &defaults);
    if body.get("json_schema").is_some() {
        sampling.grammar = JSON_CHARSET.to_string();
    }

    let n_predict = body
        .get("n_predict")
        .or_else(|| body.get("max_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(state.config.n_predict as i64) as i32;

    let stop = body
        .get("stop")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let speculative = SpeculativeParams {
        n_min: body
            .pointer("/speculative/n_min")
            .and_then(Value::as_u64)
            .unwrap_or(state.config.spec_n_min as u64) as usize,
        n_max: body
            .pointer("/speculative/n_max")
            .and_then(Value::as_u64)
            .unwrap_or(state.config.spec_n_max as u64) as usize,
        p_min: body
            .pointer("/speculative/p_min")
            .and_then(Value::as_f64)
            .unwrap_or(state.config.spec_p_min as f64) as f32,
    };

    let slot_id = body
        .get("id_slot")
        .and_then(Value::as_u64)
        .map(|v| v as usize);
    if let Some(id) = slot_id {
        if id >= state.scheduler.total_slots {
            return Err(ServerError::invalid(format!("invalid slot id {id}")));
        }
    }

    Ok(SlotParams {
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        cache_prompt: body
            .get("cache_prompt")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        n_predict,
        n_keep: body
            .get("n_keep")
            .and_then(Value::as_i64)
            .unwrap_or(state.config.n_keep as i64) as i32,
        n_discard: body.get("n_discard").and_then(Value::as_i64).unwrap_or(0) as i32,
        stop,
        sampling,
        speculative,
        slot_id,
    })
}

/// Collect a one-shot result or stream SSE frames, per the request
async fn run_completion(
    scheduler: Arc<SchedulerHandle>,
    task: CompletionTask,
) -> Response {
    let stream = task.params.stream;
    let (task_id, rx) = scheduler.submit(TaskPayload::Completion(Box::new(task)));

    if stream {
        sse_response(scheduler, task_id, rx, false)
    } else {
        match collect_final(rx).await {
            Ok(data) => Json(data).into_response(),
            Err(err) => err.into_response(),
        }
    }
}

/// Wait for the single final frame of a non-streaming task
pub(crate) async fn collect_final(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<crate::task::TaskResult>,
) -> Result<Value> {
    while let Some(result) = rx.recv().await {
        if result.error {
            return Err(ServerError::server(
                result.data["error"]["message"]
                    .as_str()
                    .unwrap_or("task failed")
                    .to_string(),
            ));
        }
        if result.stop {
            return Ok(result.data);
        }
    }
    Err(ServerError::server("scheduler dropped the task"))
}

/// Guard that cancels the task if the client walks away mid-stream
struct CancelOnDrop {
    scheduler: Arc<SchedulerHandle>,
    task_id: i32,
    finished: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(task = self.task_id, "client disconnected, cancelling");
            let (_, _rx) = self.scheduler.cancel(self.task_id);
        }
    }
}

/// Turn the result channel into `data:` lines
fn sse_response(
    scheduler: Arc<SchedulerHandle>,
    task_id: i32,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<crate::task::TaskResult>,
    oai_chat: bool,
) -> Response {
    let mut guard = CancelOnDrop {
        scheduler,
        task_id,
        finished: false,
    };
    let mut index = 0u64;

    let stream: std::pin::Pin<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>> =
        Box::pin(async_stream(move |yielder| async move {
            while let Some(result) = rx.recv().await {
                let done = result.stop || result.error;
                let data = if oai_chat {
                    chat_chunk(&result.data, done && !result.error)
                } else {
                    let mut data = result.data;
                    if let Some(obj) = data.as_object_mut() {
                        obj.insert("index".into(), json!(index));
                    }
                    data
                };
                index += 1;

                let payload = serde_json::to_string(&data).unwrap_or_default();
                if yielder.send(Ok(Event::default().data(payload))).await.is_err() {
                    return;
                }
                if done {
                    guard.finished = true;
                    return;
                }
            }
            guard.finished = true;
        }));

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// A tiny channel-backed stream builder (the SSE body wants a `Stream`,
/// the result pump is naturally a loop)
fn async_stream<F, Fut>(
    f: F,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> + Send
where
    F: FnOnce(tokio::sync::mpsc::Sender<std::result::Result<Event, Infallible>>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(f(tx));
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

/// Shape one streamed frame as an OpenAI chat chunk
fn chat_chunk(data: &Value, is_final: bool) -> Value {
    let content = data["content"].as_str().unwrap_or("");
    if is_final {
        json!({
            "object": "chat.completion.chunk",
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": (if data["stopped_limit"].as_bool().unwrap_or(false) {
                    "length"
                } else {
                    "stop"
                }),
            }],
        })
    } else {
        json!({
            "object": "chat.completion.chunk",
            "choices": [{
                "index": 0,
                "delta": { "content": content },
                "finish_reason": Value::Null,
            }],
        })
    }
}

/// `POST /completion`, `POST /v1/completions`
pub async fn handle_completion(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response> {
    let params = parse_params(&body, &state)?;
    let prompt = body
        .get("prompt")
        .cloned()
        .ok_or_else(|| ServerError::invalid("missing prompt"))?;

    Ok(run_completion(
        state.scheduler.clone(),
        CompletionTask {
            prompt,
            params,
            mode: CompletionMode::Normal,
        },
    )
    .await)
}

/// `POST /chat/completions`, `POST /v1/chat/completions`
pub async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response> {
    let params = parse_params(&body, &state)?;
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| ServerError::invalid("missing messages"))?;

    // flatten the conversation; template formatting lives outside the core
    let mut prompt = String::new();
    for message in messages {
        let role = message["role"].as_str().unwrap_or("user");
        let content = message["content"].as_str().unwrap_or("");
        prompt.push_str(role);
        prompt.push_str(": ");
        prompt.push_str(content);
        prompt.push('\n');
    }
    prompt.push_str("assistant: ");

    let stream = params.stream;
    let task = CompletionTask {
        prompt: json!(prompt),
        params,
        mode: CompletionMode::Normal,
    };

    if stream {
        let (task_id, rx) = state
            .scheduler
            .submit(TaskPayload::Completion(Box::new(task)));
        return Ok(sse_response(state.scheduler.clone(), task_id, rx, true));
    }

    let (_, rx) = state
        .scheduler
        .submit(TaskPayload::Completion(Box::new(task)));
    let data = collect_final(rx).await?;

    Ok(Json(json!({
        "object": "chat.completion",
        "model": state.config.model_alias,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": data["content"],
            },
            "finish_reason": (if data["stopped_limit"].as_bool().unwrap_or(false) {
                "length"
            } else {
                "stop"
            }),
        }],
        "usage": {
            "prompt_tokens": data["tokens_evaluated"],
            "completion_tokens": data["tokens_predicted"],
        },
    }))
    .into_response())
}

/// `POST /infill`
pub async fn handle_infill(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response> {
    let params = parse_params(&body, &state)?;
    let prefix = body
        .get("input_prefix")
        .and_then(Value::as_str)
        .ok_or_else(|| ServerError::invalid("missing input_prefix"))?;
    let suffix = body
        .get("input_suffix")
        .and_then(Value::as_str)
        .ok_or_else(|| ServerError::invalid("missing input_suffix"))?;

    let (Some(fim_pre), Some(fim_suf)) = (
        state.tokenizer.fim_prefix_token(),
        state.tokenizer.fim_suffix_token(),
    ) else {
        return Err(ServerError::not_supported(
            "the vocabulary has no fill-in-middle markers",
        ));
    };

    // assemble the infill prompt as a mixed token array
    let mut tokens: Vec<Value> = vec![json!(fim_pre)];
    tokens.extend(
        state
            .tokenizer
            .tokenize(prefix, false)
            .into_iter()
            .map(|t| json!(t)),
    );
    tokens.push(json!(fim_suf));
    tokens.extend(
        state
            .tokenizer
            .tokenize(suffix, false)
            .into_iter()
            .map(|t| json!(t)),
    );

    Ok(run_completion(
        state.scheduler.clone(),
        CompletionTask {
            prompt: Value::Array(tokens),
            params,
            mode: CompletionMode::Infill,
        },
    )
    .await)
}
