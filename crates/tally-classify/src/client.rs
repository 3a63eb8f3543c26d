//! OpenAI-compatible classification backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, instrument, warn};

use tally_core::{
    Category, Classifier, ClassificationResult, Error, Result, TransactionFacts,
};

use crate::config::ClassifyConfig;
use crate::parse::parse_reply;

/// Classification client for an OpenAI-style chat-completions endpoint.
///
/// All business-level failures (missing credential, unreachable service,
/// non-success status, malformed reply) degrade to the fallback result so a
/// single bad external call never fails a job. The one exception is a request
/// timeout: its true outcome is unknown, so it surfaces as
/// [`Error::ClassificationTimeout`] and the worker retries.
pub struct OpenAiClassifier {
    client: Client,
    config: ClassifyConfig,
}

impl OpenAiClassifier {
    pub fn new(config: ClassifyConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, config }
    }

    /// Create from environment variables.
    pub fn from_env() -> Self {
        Self::new(ClassifyConfig::from_env())
    }

    fn system_prompt() -> String {
        let labels: Vec<&str> = Category::ALL.iter().map(|c| c.label()).collect();
        format!(
            "You are a bookkeeping assistant that categorizes business transactions. \
             Respond with a JSON object: {{\"category\": string, \"confidence\": number \
             between 0 and 1, \"reasoning\": string}}. The category MUST be exactly one \
             of: {}.",
            labels.join(", ")
        )
    }

    fn user_prompt(facts: &TransactionFacts) -> String {
        let mut lines = vec![
            format!("Description: {}", facts.description),
            format!("Amount: {:.2}", facts.amount),
        ];
        if let Some(merchant) = &facts.merchant {
            lines.push(format!("Merchant: {merchant}"));
        }
        if let Some(date) = &facts.date {
            lines.push(format!("Date: {}", date.to_rfc3339()));
        }
        if let Some(metadata) = &facts.metadata {
            lines.push(format!("Metadata: {metadata}"));
        }
        lines.join("\n")
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    content: String,
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    #[instrument(skip(self, facts), fields(subsystem = "classify", component = "openai", op = "classify", model = %self.config.model))]
    async fn classify(&self, facts: &TransactionFacts) -> Result<ClassificationResult> {
        if facts.description.trim().is_empty() {
            return Err(Error::InvalidInput(
                "transaction description must be non-empty".to_string(),
            ));
        }
        if !facts.amount.is_finite() {
            return Err(Error::InvalidInput(
                "transaction amount must be a finite number".to_string(),
            ));
        }

        let Some(api_key) = &self.config.api_key else {
            debug!("No classification credential configured, returning fallback");
            return Ok(ClassificationResult::fallback(
                "No classification credential configured",
            ));
        };

        let start = Instant::now();
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Self::system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: Self::user_prompt(facts),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                // Unknown outcome, must retry rather than fall back.
                return Err(Error::ClassificationTimeout(e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "Classification request failed, returning fallback");
                return Ok(ClassificationResult::fallback(format!(
                    "Classification request failed: {e}"
                )));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Classification service returned an error status");
            return Ok(ClassificationResult::fallback(format!(
                "Classification service returned {status}: {body}"
            )));
        }

        let reply: ChatResponse = match response.json().await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Malformed classification response envelope");
                return Ok(ClassificationResult::fallback(format!(
                    "Malformed classification response: {e}"
                )));
            }
        };

        let Some(content) = reply.choices.first().map(|c| c.message.content.as_str()) else {
            return Ok(ClassificationResult::fallback(
                "Classification response contained no choices",
            ));
        };

        let result = parse_reply(content);
        debug!(
            category = %result.category,
            confidence = result.confidence,
            duration_ms = start.elapsed().as_millis() as u64,
            "Classification complete"
        );
        Ok(result)
    }
}
