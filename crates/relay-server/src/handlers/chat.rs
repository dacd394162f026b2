// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `POST /v1/chat/completions`

use crate::error::{ErrorBody, ErrorEnvelope, ServerError, ServerResult};
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use relay_core::{ChatRequest, StreamItem};
use std::convert::Infallible;
use std::time::Duration;
use tracing::info;

/// Terminal SSE payload expected by OpenAI clients
pub const DONE_MARKER: &str = "[DONE]";

/// Buffered JSON or an SSE stream, depending on `stream`
pub async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ServerResult<Response> {
    let Json(request) = payload.map_err(|rejection| ServerError::BadRequest(rejection.body_text()))?;
    if request.messages.is_empty() {
        return Err(ServerError::BadRequest("messages must not be empty".to_string()));
    }

    info!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "Chat completion request"
    );

    if request.stream {
        let items = state.relay.stream(request).await?;
        Ok(sse_body(items)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
            .into_response())
    } else {
        let completion = state.relay.complete(request).await?;
        Ok(Json(completion).into_response())
    }
}

fn sse_event(item: StreamItem) -> Result<Event, Infallible> {
    let data = match item {
        StreamItem::Chunk(chunk) => chunk.to_string(),
        StreamItem::Error(message) => {
            let envelope = ErrorEnvelope {
                error: ErrorBody {
                    message,
                    kind: "server_error",
                    code: None,
                },
            };
            serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".into())
        }
        StreamItem::Done => DONE_MARKER.to_string(),
    };
    Ok(Event::default().data(data))
}

/// Encode relay stream items as `data:` events
pub fn sse_body(
    items: impl Stream<Item = StreamItem> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(items.map(sse_event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn render(items: Vec<StreamItem>) -> String {
        let response = sse_body(stream::iter(items)).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn chunks_are_framed_as_data_lines_and_end_with_done() {
        let body = render(vec![
            StreamItem::Chunk(json!({"choices": [{"delta": {"content": "hi"}}]})),
            StreamItem::Done,
        ])
        .await;
        assert_eq!(
            body,
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn errors_are_sent_as_error_objects() {
        let body = render(vec![StreamItem::Error("tool crashed".to_string()), StreamItem::Done]).await;
        let first = body.lines().next().unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(first.strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(payload["error"]["message"], "tool crashed");
        assert_eq!(payload["error"]["type"], "server_error");
        assert!(body.ends_with("data: [DONE]\n\n"));
    }
}
