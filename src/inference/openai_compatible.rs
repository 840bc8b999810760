use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, header};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    gate::types::ChatMessage,
    inference::{
        client::{FragmentStream, StreamingInferenceClient},
        credentials::Credential,
        error::{InferenceError, map_http_error, protocol_error, transport_error},
        types::SamplingConfig,
    },
};

/// Chat completions over `POST {endpoint}/chat/completions` with `stream: true`,
/// parsed from server-sent events.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
}

impl OpenAiCompatibleClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .pool_idle_timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client must build"),
            endpoint: endpoint.into(),
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl StreamingInferenceClient for OpenAiCompatibleClient {
    async fn open(
        &self,
        credential: &Credential,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<FragmentStream, InferenceError> {
        let body = json!({
            "model": sampling.model,
            "messages": messages,
            "temperature": sampling.temperature,
            "max_tokens": sampling.max_output_tokens,
            "stream": true,
        });

        let response = self
            .client
            .post(self.url())
            .timeout(Duration::from_millis(sampling.request_timeout_ms.max(1)))
            .header(header::CONTENT_TYPE, "application/json")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", credential.secret()),
            )
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                transport_error(format!("chat completion request failed: {}", err))
                    .with_credential(credential.fingerprint())
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body).with_credential(credential.fingerprint()));
        }

        let (tx, rx) = mpsc::channel::<Result<String, InferenceError>>(64);
        let fingerprint = credential.fingerprint().to_string();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();

            while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx
                            .send(Err(transport_error(format!(
                                "chat completion stream chunk error: {}",
                                err
                            ))
                            .with_credential(fingerprint.clone())))
                            .await;
                        return;
                    }
                };

                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    let parsed = match line {
                        Ok(line) => parse_sse_line(&line),
                        Err(err) => SseLine::Failed(err),
                    };
                    match parsed {
                        SseLine::Skip => continue,
                        SseLine::Done => return,
                        SseLine::Fragments(fragments) => {
                            for fragment in fragments {
                                if tx.send(Ok(fragment)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        SseLine::Failed(err) => {
                            let _ = tx.send(Err(err.with_credential(fingerprint.clone()))).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Raw bytes until a full line arrives. Chunk boundaries can fall inside a
/// multi-byte character, so decoding waits for the newline.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Result<String, InferenceError>> {
        let idx = self.pending.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=idx).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8(line).map_err(|err| {
            protocol_error(format!("chat completion SSE line is not valid UTF-8: {}", err))
        }))
    }
}

#[derive(Debug)]
enum SseLine {
    Skip,
    Done,
    Fragments(Vec<String>),
    Failed(InferenceError),
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data.is_empty() {
        return SseLine::Skip;
    }
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let payload = match serde_json::from_str::<Value>(data) {
        Ok(payload) => payload,
        Err(err) => {
            return SseLine::Failed(protocol_error(format!(
                "failed to parse chat completion SSE payload: {}",
                err
            )));
        }
    };

    // Some providers report quota exhaustion as an in-stream error object.
    if let Some(error) = payload.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return SseLine::Failed(transport_error(message));
    }

    let Some(choices) = payload.get("choices").and_then(Value::as_array) else {
        return SseLine::Failed(protocol_error("chat completion SSE payload missing choices"));
    };

    let fragments = choices
        .iter()
        .filter_map(|choice| {
            choice
                .get("delta")
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
        })
        .filter(|content| !content.is_empty())
        .map(str::to_string)
        .collect();

    SseLine::Fragments(fragments)
}
