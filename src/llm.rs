use crate::config::{LlmConfig, DUMMY_API_KEY};
use crate::error::{ReflectError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

lazy_static! {
    static ref DUMMY_QUERY_BLOCK: Regex =
        Regex::new(r"(?s)SQL Query:\s*```sql\s*(.*?)\s*```").unwrap();
    static ref DUMMY_TABLE_NAME: Regex = Regex::new(r"Use table name '([^']+)'").unwrap();
}

/// Opaque text-completion service: one prompt in, one completion out.
///
/// Temperature 0 is treated as deterministic generation.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String>;
}

/// Remove a surrounding markdown code fence (```json / ```sql / ```), if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let inner = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```sql") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        trimmed
    };
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Client for OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.model.clone(),
            config.base_url.clone(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Canned completions so the pipeline runs end to end without a key.
    fn dummy_completion(prompt: &str) -> String {
        if prompt.contains("\"refined_sql\"") {
            let query = DUMMY_QUERY_BLOCK
                .captures(prompt)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            return serde_json::json!({
                "feedback": "No semantic issues detected.",
                "refined_sql": query,
            })
            .to_string();
        }

        if prompt.contains("Respond with the SQL query only") {
            let table = DUMMY_TABLE_NAME
                .captures(prompt)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "transactions".to_string());
            return format!("SELECT * FROM {} LIMIT 10", table);
        }

        "The query was reviewed against the observed output (offline mode, no model was called).".to_string()
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
        if self.api_key == DUMMY_API_KEY {
            return Ok(Self::dummy_completion(prompt));
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "temperature": temperature,
        });

        // Reasoning models spend completion tokens on reasoning
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(2000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(500);
        } else {
            body["max_tokens"] = serde_json::json!(500);
        }

        debug!("Calling {} (temperature {})", self.model, temperature);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ReflectError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ReflectError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ReflectError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(ReflectError::Llm(format!("LLM API error: {}", error)));
        }

        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .ok_or_else(|| ReflectError::Llm("No choices array in LLM response".to_string()))?;

        let first = choices
            .first()
            .ok_or_else(|| ReflectError::Llm("Empty choices array in LLM response".to_string()))?;

        match first.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => warn!("LLM response was truncated due to length limit"),
            Some("content_filter") => {
                return Err(ReflectError::Llm(
                    "LLM response was filtered by content policy".to_string(),
                ))
            }
            _ => {}
        }

        let content = first["message"]["content"]
            .as_str()
            .ok_or_else(|| ReflectError::Llm("No content in LLM response".to_string()))?;

        if content.trim().is_empty() {
            return Err(ReflectError::Llm("Empty content in LLM response".to_string()));
        }

        Ok(content.trim().to_string())
    }
}
