//! Local-model backend speaking Ollama's generate API.

use crate::config::ProviderConfig;
use crate::context::ContextSnapshot;
use crate::http_client::{HttpClient, TransportError};
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
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

pub struct OllamaProvider {
    name: String,
    host: String,
    model: String,
    http: Arc<dyn HttpClient>,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig, http: Arc<dyn HttpClient>) -> Self {
        Self {
            name: format!("ollama:{}", config.model_name),
            host: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model_name.clone(),
            http,
        }
    }

    async fn generate(
        &self,
        prompt: String,
        num_predict: u32,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/api/generate", self.host);
        let request_body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.1,
                "num_predict": num_predict,
            },
        });

        let response = with_deadline(timeout, async {
            self.http
                .post_json(&url, &[("Content-Type", "application/json")], &request_body)
                .await
                .map_err(|e| match e {
                    TransportError::Connect(msg) => ProviderError::Unavailable(format!(
                        "cannot reach Ollama at {} ({}); is `ollama serve` running?",
                        self.host, msg
                    )),
                    other => classify_transport(other, timeout, &self.host),
                })
        })
        .await?;

        if response.status == 404 {
            warn!("Ollama does not know model {}", self.model);
            return Err(ProviderError::Unavailable(format!(
                "model '{}' not found; run `ollama pull {}`",
                self.model, self.model
            )));
        }
        if !response.is_success() {
            warn!("Ollama generate failed with HTTP {}", response.status);
            return Err(classify_status(&response, timeout));
        }
        debug!("Ollama response: {}", response.body);

        let parsed: GenerateResponse = serde_json::from_str(&response.body)
            .map_err(|e| ProviderError::MalformedResponse(format!("invalid JSON: {}", e)))?;
        parsed
            .response
            .ok_or_else(|| ProviderError::MalformedResponse("missing 'response' field".to_string()))
    }
}

#[async_trait]
impl CommandProvider for OllamaProvider {
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
        let prompt = format!("{}\n\n{}", build_system_prompt(), build_user_prompt(goal, context));
        let raw = self.generate(prompt, 50, timeout).await?;
        let command = clean_command(&raw)?;
        Ok(CandidateCommand::new(command, goal))
    }

    async fn explain_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        info!("Requesting explanation from {}", self.name);
        let prompt = format!("{}\n\nCommand: {}", build_explain_prompt(), command);
        let raw = self.generate(prompt, 256, timeout).await?;
        if raw.trim().is_empty() {
            return Err(ProviderError::MalformedResponse("empty explanation".to_string()));
        }
        Ok(raw)
    }

    async fn is_reachable(&self, timeout: Duration) -> bool {
        let url = format!("{}/api/tags", self.host);
        matches!(
            tokio::time::timeout(timeout, self.http.get(&url, &[])).await,
            Ok(Ok(response)) if response.is_success()
        )
    }
}
