//! OpenAI-compatible HTTP backend with an ordered model fallback chain.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{CallResult, EmbeddingTask, GenerateRequest, LanguageModel};

pub struct HttpLanguageModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    fallback_models: Vec<String>,
}

impl HttpLanguageModel {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, fallback_models: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .context("building http client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            api_key,
            fallback_models,
        })
    }

    async fn chat_once(&self, model: &str, request: &GenerateRequest) -> Result<String> {
        let mut body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.context("sending chat request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("chat backend returned {status}: {}", crate::config::clip(&text, 200));
        }

        let parsed: ChatResponse = resp.json().await.context("decoding chat response")?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.map(|m| m.content))
            .ok_or_else(|| anyhow!("chat response carried no choices"))?;
        Ok(text)
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn generate(&self, request: GenerateRequest) -> Result<CallResult> {
        let mut chain = Vec::with_capacity(1 + self.fallback_models.len());
        chain.push(request.model.clone());
        for m in &self.fallback_models {
            if !chain.contains(m) {
                chain.push(m.clone());
            }
        }

        let mut last_err = None;
        for model in &chain {
            match self.chat_once(model, &request).await {
                Ok(text) => {
                    debug!(model, chars = text.chars().count(), "chat call succeeded");
                    return Ok(CallResult {
                        text,
                        model: model.clone(),
                    });
                }
                Err(err) => {
                    warn!(model, error = %err, "chat call failed, trying next model");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no models configured")))
    }

    async fn embed(&self, task: EmbeddingTask) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": task.model,
            "input": task.inputs,
            "task_type": task.kind.as_str(),
        });
        let mut req = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.context("sending embedding request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("embedding backend returned {status}: {}", crate::config::clip(&text, 200));
        }

        let parsed: EmbeddingResponse = resp.json().await.context("decoding embedding response")?;
        let mut rows: Vec<(usize, Vec<f32>)> = parsed
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        rows.sort_by_key(|(i, _)| *i);
        let vectors: Vec<Vec<f32>> = rows.into_iter().map(|(_, v)| v).collect();

        if vectors.len() != task.inputs.len() {
            bail!(
                "embedding count mismatch: asked {} got {}",
                task.inputs.len(),
                vectors.len()
            );
        }
        for (i, v) in vectors.iter().enumerate() {
            if v.len() != task.dim {
                bail!("embedding {i} has dim {} (expected {})", v.len(), task.dim);
            }
        }
        Ok(vectors)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}
