use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::types::{Message, MessagesRequest, MessagesResponse};
use crate::client::{InferenceClient, InferenceOutput};
use crate::error::InferenceError;
use crate::job::Job;

pub const API_URL: &str = "https://api.anthropic.com/v1/messages";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    api_key: String,
    model: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String) -> Result<Self, InferenceError> {
        Self::with_base_url(api_key, model, API_URL.to_string())
    }

    /// Create a client pointing at a custom endpoint (proxies, testing).
    pub fn with_base_url(
        api_key: String,
        model: String,
        base_url: String,
    ) -> Result<Self, InferenceError> {
        Self::with_timeouts(api_key, model, base_url, CONNECT_TIMEOUT, REQUEST_TIMEOUT)
    }

    fn with_timeouts(
        api_key: String,
        model: String,
        base_url: String,
        connect: Duration,
        request: Duration,
    ) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .connect_timeout(connect)
            .timeout(request)
            .build()?;
        Ok(Self {
            api_key,
            model,
            client,
            base_url,
        })
    }

    /// Builds the Messages request for a test case.
    ///
    /// The first turn of `question` becomes the conversation; `function`, when
    /// present, is offered to the model in the system prompt. Entries without
    /// a `question` are sent verbatim as a single user message.
    pub fn build_request(&self, job: &Job) -> MessagesRequest {
        let mut system = None;
        let mut messages = Vec::new();

        if let Some(turn) = job
            .payload
            .get("question")
            .and_then(|q| q.get(0))
            .and_then(Value::as_array)
        {
            for message in turn {
                let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
                let content = match message.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                if role == "system" {
                    system = Some(content);
                } else {
                    messages.push(Message {
                        role: role.to_string(),
                        content,
                    });
                }
            }
        }
        if messages.is_empty() {
            messages.push(Message {
                role: "user".into(),
                content: job.payload.to_string(),
            });
        }

        if let Some(functions) = job.payload.get("function").filter(|f| !f.is_null()) {
            let offer = format!(
                "You have access to the following functions. Respond with the calls to make \
                 as a JSON list of {{\"name\": {{\"param\": value}}}} objects.\n{functions}"
            );
            system = Some(match system {
                Some(prompt) => format!("{prompt}\n\n{offer}"),
                None => offer,
            });
        }

        MessagesRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            messages,
            system,
            temperature: Some(0.001),
        }
    }

    pub async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, InferenceError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(InferenceError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await.map_err(transport)?;
        serde_json::from_str(&body).map_err(|e| InferenceError::Parse(e.to_string()))
    }
}

impl InferenceClient for AnthropicClient {
    async fn infer(&self, job: &Job) -> Result<InferenceOutput, InferenceError> {
        let request = self.build_request(job);
        let started = Instant::now();
        let response = self.send_message(&request).await?;
        let latency = started.elapsed().as_secs_f64();

        if response.stop_reason.as_deref() == Some("refusal") {
            return Err(InferenceError::Other(
                "response blocked by content_filter".to_string(),
            ));
        }

        let text: String = response
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .map(|block| block.text.as_str())
            .collect();

        Ok(InferenceOutput::new(Value::String(text))
            .with_metadata("input_token_count", json!(response.usage.input_tokens))
            .with_metadata("output_token_count", json!(response.usage.output_tokens))
            .with_metadata("latency", json!(latency)))
    }
}

fn transport(err: reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout(err.to_string())
    } else {
        InferenceError::Network(err)
    }
}
