//! Provider abstraction over natural-language-to-command backends.
//!
//! The orchestrator only ever sees [`CommandProvider`]. Backends differ in
//! wire format and transport, but share prompt construction, deadline
//! enforcement, HTTP status classification and response cleaning, all of
//! which live here.

use crate::config::{ProviderConfig, ProviderKind};
use crate::context::ContextSnapshot;
use crate::http_client::{HttpClient, HttpResponse, TransportError};
use crate::ollama_provider::OllamaProvider;
use crate::openai_provider::OpenAiProvider;
use crate::safety::RiskTier;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// A generated command and its safety assessment.
///
/// Providers create it with neutral risk fields; only
/// [`SafetyEngine::assess`](crate::safety::SafetyEngine::assess) fills them in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateCommand {
    pub text: String,
    pub source_goal: String,
    pub risk_score: f32,
    pub risk_tier: RiskTier,
    pub hardened: bool,
    pub blocked: bool,
    pub block_reason: Option<String>,
    /// Human-readable findings: matched caution rules, applied hardening.
    pub notes: Vec<String>,
}

impl CandidateCommand {
    pub fn new(text: impl Into<String>, source_goal: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_goal: source_goal.into(),
            risk_score: 0.0,
            risk_tier: RiskTier::Safe,
            hardened: false,
            blocked: false,
            block_reason: None,
            notes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    AuthFailure,
    RateLimited,
    Unavailable,
    MalformedResponse,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("provider rejected credentials: {0}")]
    AuthFailure(String),
    #[error("provider rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider returned an unusable response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::Timeout(_) => ProviderErrorKind::Timeout,
            ProviderError::AuthFailure(_) => ProviderErrorKind::AuthFailure,
            ProviderError::RateLimited(_) => ProviderErrorKind::RateLimited,
            ProviderError::Unavailable(_) => ProviderErrorKind::Unavailable,
            ProviderError::MalformedResponse(_) => ProviderErrorKind::MalformedResponse,
        }
    }
}

/// Uniform capability implemented by every generation backend.
#[async_trait]
pub trait CommandProvider: Send + Sync {
    /// Short identifier recorded in the audit trail, e.g. `openai:gpt-4o-mini`.
    fn name(&self) -> &str;

    /// Turns `goal` into exactly one shell command line.
    async fn generate_command(
        &self,
        goal: &str,
        context: &ContextSnapshot,
        timeout: Duration,
    ) -> Result<CandidateCommand, ProviderError>;

    /// Describes what `command` does, in prose.
    async fn explain_command(&self, command: &str, timeout: Duration)
    -> Result<String, ProviderError>;

    /// Cheap liveness check backing the daemon's status endpoint.
    async fn is_reachable(&self, timeout: Duration) -> bool;
}

/// Builds the backend named by `config`.
pub fn from_config(
    config: &ProviderConfig,
    use_mock: bool,
    http: Arc<dyn HttpClient>,
) -> Arc<dyn CommandProvider> {
    if use_mock {
        info!("Using mock provider (AISHELL_USE_MOCK)");
        return Arc::new(MockProvider::new());
    }
    match config.kind {
        ProviderKind::ApiKeyService => {
            info!("Using API-key provider {} at {}", config.model_name, config.endpoint);
            Arc::new(OpenAiProvider::new(config, http))
        }
        ProviderKind::LocalService => {
            info!("Using local provider {} at {}", config.model_name, config.endpoint);
            Arc::new(OllamaProvider::new(config, http))
        }
    }
}

/// Runs `fut` under `timeout`, mapping expiry to [`ProviderError::Timeout`].
pub async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Provider call exceeded {:?}", timeout);
            Err(ProviderError::Timeout(timeout))
        }
    }
}

/// Maps transport failures onto provider error kinds.
pub fn classify_transport(err: TransportError, timeout: Duration, service: &str) -> ProviderError {
    match err {
        TransportError::Timeout => ProviderError::Timeout(timeout),
        TransportError::Connect(msg) => {
            ProviderError::Unavailable(format!("cannot reach {}: {}", service, msg))
        }
        TransportError::Other(msg) => ProviderError::Unavailable(msg),
    }
}

/// Maps a non-2xx status onto a provider error kind.
pub fn classify_status(response: &HttpResponse, timeout: Duration) -> ProviderError {
    let detail = format!("HTTP {}: {}", response.status, snippet(&response.body));
    match response.status {
        401 | 403 => ProviderError::AuthFailure(detail),
        408 | 504 => ProviderError::Timeout(timeout),
        429 => ProviderError::RateLimited(detail),
        _ => ProviderError::Unavailable(detail),
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(200) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

pub fn build_system_prompt() -> String {
    "You are a helpful assistant that converts natural language goals into \
     safe, single-line shell commands for macOS/Unix systems. \
     Return ONLY the command, no explanation or formatting. \
     Prefer commands with dry-run flags when available. \
     Never return destructive commands without confirmation flags."
        .to_string()
}

pub fn build_explain_prompt() -> String {
    "You explain shell commands to the person about to run them. \
     Describe in two or three plain sentences what the command does, \
     what it changes on disk or over the network, and any risk. \
     Do not suggest alternatives."
        .to_string()
}

pub fn build_user_prompt(goal: &str, context: &ContextSnapshot) -> String {
    let mut parts = vec![format!("Goal: {}", goal)];

    parts.push(format!("Current directory: {}", context.working_directory.display()));
    parts.push(format!("Shell: {}", context.shell_kind.as_str()));
    parts.push(format!("OS: {}", context.os));

    if let Some(branch) = &context.vcs_branch {
        let state = if context.vcs_dirty { "uncommitted changes" } else { "clean" };
        parts.push(format!("Git branch: {} ({})", branch, state));
    }

    if !context.directory_sample.is_empty() {
        parts.push(format!("Files in directory: {}", context.directory_sample.join(", ")));
    }

    parts.join("\n")
}

/// Extracts the single command line from a raw model reply.
///
/// Code fences, surrounding backticks and a leading `$ ` prompt are
/// stripped. Anything left that is empty or spans more than one line is
/// rejected rather than truncated.
pub fn clean_command(raw: &str) -> Result<String, ProviderError> {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_fence(line))
        .collect();

    let line = match lines.as_slice() {
        [] => return Err(ProviderError::MalformedResponse("empty response".to_string())),
        [single] => *single,
        _ => {
            return Err(ProviderError::MalformedResponse(format!(
                "expected one command line, got {}",
                lines.len()
            )));
        }
    };

    let command = line
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim_matches('`')
        .trim();
    let command = command.strip_prefix("$ ").unwrap_or(command).trim();

    if command.is_empty() {
        return Err(ProviderError::MalformedResponse("empty command".to_string()));
    }
    if command.chars().any(|c| c.is_control()) {
        return Err(ProviderError::MalformedResponse(
            "command contains control characters".to_string(),
        ));
    }
    Ok(command.to_string())
}

/// A fence line is three backticks plus an optional language tag.
fn is_fence(line: &str) -> bool {
    line.strip_prefix("```")
        .map(|tag| tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(false)
}

/// Deterministic stand-in used in mock mode.
///
/// Picks a canned command from keywords in the goal, so the whole pipeline
/// can run without a model.
pub struct MockProvider;

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn mock_command_for(&self, goal: &str) -> String {
        let goal = goal.to_lowercase();
        let command = if goal.contains("sync") || goal.contains("backup") {
            "rsync -av src/ dest/"
        } else if goal.contains("large") && goal.contains("log") {
            "find . -name '*.log' -size +10M"
        } else if goal.contains("branch") {
            "git branch --show-current"
        } else if goal.contains("disk") || goal.contains("space") {
            "df -h"
        } else if goal.contains("clean") && goal.contains("untracked") {
            "git clean -fd"
        } else if goal.contains("wipe") || goal.contains("everything") {
            "rm -rf /"
        } else if goal.contains("time") || goal.contains("date") {
            "date"
        } else {
            "ls -la"
        };
        command.to_string()
    }
}

#[async_trait]
impl CommandProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate_command(
        &self,
        goal: &str,
        _context: &ContextSnapshot,
        _timeout: Duration,
    ) -> Result<CandidateCommand, ProviderError> {
        Ok(CandidateCommand::new(self.mock_command_for(goal), goal))
    }

    async fn explain_command(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> Result<String, ProviderError> {
        let program = command.split_whitespace().next().unwrap_or("");
        Ok(format!("Mock explanation: `{}` runs the program `{}`.", command, program))
    }

    async fn is_reachable(&self, _timeout: Duration) -> bool {
        true
    }
}
