//! API-key-authenticated backend speaking the OpenAI chat completions format.

use crate::config::{ProviderConfig, PLACEHOLDER_API_KEY};
use crate::context::ContextSnapshot;
use crate::http_client::HttpClient;
use crate::provider::{
    build_explain_prompt, build_system_prompt, build_user_prompt, classify_status,
    classify_transport, clean_command, with_deadline, CandidateCommand, CommandProvider,
    ProviderError,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiProvider {
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: Arc<dyn HttpClient>,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig, http: Arc<dyn HttpClient>) -> Self {
        Self {
            name: format!("openai:{}", config.model_name),
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model_name.clone(),
            api_key: config.credentials.clone(),
            http,
        }
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() && key != PLACEHOLDER_API_KEY => Ok(key),
            _ => Err(ProviderError::AuthFailure(
                "API key not configured; run `aishelld --set-api-key <key>` or export OPENAI_API_KEY"
                    .to_string(),
            )),
        }
    }

    async fn chat(
        &self,
        system: String,
        user: String,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!("{}/chat/completions", self.base_url);
        let authorization = format!("Bearer {}", api_key);
        let request_body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_tokens": max_tokens,
            "temperature": 0.1,
        });

        let response = with_deadline(timeout, async {
            self.http
                .post_json(
                    &url,
                    &[
                        ("Authorization", authorization.as_str()),
                        ("Content-Type", "application/json"),
                    ],
                    &request_body,
                )
                .await
                .map_err(|e| classify_transport(e, timeout, &self.base_url))
        })
        .await?;

        if !response.is_success() {
            warn!("Chat completion failed with HTTP {}", response.status);
            return Err(classify_status(&response, timeout));
        }
        debug!("Chat completion response: {}", response.body);

        let parsed: ChatResponse = serde_json::from_str(&response.body)
            .map_err(|e| ProviderError::MalformedResponse(format!("invalid JSON: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::MalformedResponse("no choices in response".to_string()))
    }
}

#[async_trait]
impl CommandProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_command(
        &self,
        goal: &str,
        context: &ContextSnapshot,
        timeout: Duration,
    ) -> Result<CandidateCommand, ProviderError> {
        info!("Requesting command from {}", self.name);
        let raw = self
            .chat(build_system_prompt(), build_user_prompt(goal, context), 100, timeout)
            .await?;
        let command = clean_command(&raw)?;
        Ok(CandidateCommand::new(command, goal))
    }

    async fn explain_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        info!("Requesting explanation from {}", self.name);
        let raw = self
            .chat(build_explain_prompt(), format!("Command: {}", command), 300, timeout)
            .await?;
        if raw.trim().is_empty() {
            return Err(ProviderError::MalformedResponse("empty explanation".to_string()));
        }
        Ok(raw)
    }

    async fn is_reachable(&self, timeout: Duration) -> bool {
        let Ok(api_key) = self.api_key() else {
            return false;
        };
        let url = format!("{}/models", self.base_url);
        let authorization = format!("Bearer {}", api_key);
        let headers = [("Authorization", authorization.as_str())];
        matches!(
            tokio::time::timeout(timeout, self.http.get(&url, &headers)).await,
            Ok(Ok(response)) if response.is_success()
        )
    }
}
