//! Suggestion pipeline: context, provider, safety gate, audit.
//!
//! Every `suggest`/`explain` call, successful or not, leaves exactly one
//! audit entry behind. Audit failures are logged and swallowed so a broken
//! log never costs the user their suggestion.

use crate::audit::{AuditEntry, AuditLog, EventKind, Outcome};
use crate::config::Config;
use crate::context::{detect_shell, ContextCollector, ContextSnapshot};
use crate::provider::{with_deadline, CandidateCommand, CommandProvider, ProviderError};
use crate::safety::SafetyEngine;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("goal is empty")]
    EmptyGoal,
    #[error("goal is {len} characters, the limit is {max}")]
    GoalTooLong { len: usize, max: usize },
    #[error("command is empty")]
    EmptyCommand,
    #[error("{0}")]
    ProviderTimeout(String),
    #[error("{0}")]
    ProviderAuthFailure(String),
    #[error("{0}")]
    ProviderRateLimited(String),
    #[error("{0}")]
    ProviderUnavailable(String),
    #[error("{0}")]
    ProviderMalformedResponse(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable machine-readable identifier, used as `error_kind` on the wire
    /// and in the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::EmptyGoal => "empty_goal",
            OrchestratorError::GoalTooLong { .. } => "goal_too_long",
            OrchestratorError::EmptyCommand => "empty_command",
            OrchestratorError::ProviderTimeout(_) => "provider_timeout",
            OrchestratorError::ProviderAuthFailure(_) => "provider_auth_failure",
            OrchestratorError::ProviderRateLimited(_) => "provider_rate_limited",
            OrchestratorError::ProviderUnavailable(_) => "provider_unavailable",
            OrchestratorError::ProviderMalformedResponse(_) => "provider_malformed_response",
            OrchestratorError::Internal(_) => "internal",
        }
    }
}

impl From<ProviderError> for OrchestratorError {
    fn from(err: ProviderError) -> Self {
        let message = err.to_string();
        match err {
            ProviderError::Timeout(_) => OrchestratorError::ProviderTimeout(message),
            ProviderError::AuthFailure(_) => OrchestratorError::ProviderAuthFailure(message),
            ProviderError::RateLimited(_) => OrchestratorError::ProviderRateLimited(message),
            ProviderError::Unavailable(_) => OrchestratorError::ProviderUnavailable(message),
            ProviderError::MalformedResponse(_) => {
                OrchestratorError::ProviderMalformedResponse(message)
            }
        }
    }
}

/// Per-request bounds, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub provider_timeout: Duration,
    pub context_timeout: Duration,
    pub max_goal_chars: usize,
    pub max_context_entries: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider_timeout: config.provider_timeout(),
            context_timeout: config.context_timeout(),
            max_goal_chars: config.limits.max_goal_chars,
            max_context_entries: config.limits.max_context_entries,
        }
    }
}

/// Where a request came from: the caller's shell, not the daemon's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RequestOrigin {
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub shell: Option<String>,
}

/// What the shell widget reports after the user ran (or declined) a suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutionReport {
    #[serde(default)]
    pub goal: Option<String>,
    pub command: String,
    pub approved: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub cwd: Option<String>,
}

pub struct Orchestrator {
    provider: Arc<dyn CommandProvider>,
    collector: ContextCollector,
    safety: SafetyEngine,
    audit: Arc<AuditLog>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn CommandProvider>,
        collector: ContextCollector,
        audit: Arc<AuditLog>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            provider,
            collector,
            safety: SafetyEngine::new(),
            audit,
            settings,
        }
    }

    pub fn provider(&self) -> &Arc<dyn CommandProvider> {
        &self.provider
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Suggests a command for `goal` in the daemon's own directory.
    pub async fn suggest(&self, goal: &str) -> Result<CandidateCommand, OrchestratorError> {
        self.suggest_in(goal, &RequestOrigin::default()).await
    }

    /// Suggests a command for `goal` in the caller's directory and shell.
    ///
    /// Blocked commands are returned, not turned into errors; the caller
    /// decides how to present them.
    pub async fn suggest_in(
        &self,
        goal: &str,
        origin: &RequestOrigin,
    ) -> Result<CandidateCommand, OrchestratorError> {
        let goal = goal.trim();
        let cwd = origin.cwd.as_ref().map(|p| p.display().to_string());

        if let Err(err) = self.validate_goal(goal) {
            info!("Rejected goal locally: {}", err);
            self.record_failure(EventKind::Suggested, Some(goal), None, cwd, &err);
            return Err(err);
        }

        let context = self.collect_context(origin).await;
        let cwd = Some(context.working_directory.display().to_string());
        info!("Suggesting via {} for goal: {}", self.provider.name(), goal);

        let timeout = self.settings.provider_timeout;
        let generated =
            with_deadline(timeout, self.provider.generate_command(goal, &context, timeout)).await;
        let candidate = match generated {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!("Provider {} failed: {}", self.provider.name(), err);
                let err = OrchestratorError::from(err);
                self.record_failure(EventKind::Suggested, Some(goal), None, cwd, &err);
                return Err(err);
            }
        };

        let assessed = self.safety.assess(candidate);
        if assessed.blocked {
            warn!(
                "Blocked '{}': {}",
                assessed.text,
                assessed.block_reason.as_deref().unwrap_or("unspecified")
            );
        } else {
            info!(
                "Suggested '{}' (tier={}, hardened={})",
                assessed.text, assessed.risk_tier, assessed.hardened
            );
        }

        let kind = if assessed.blocked { EventKind::Blocked } else { EventKind::Suggested };
        let mut entry = self.audit.entry(kind, self.provider.name());
        entry.goal = Some(goal.to_string());
        entry.command_text = Some(assessed.text.clone());
        entry.risk_tier = Some(assessed.risk_tier);
        entry.risk_score = Some(assessed.risk_score);
        entry.hardened = assessed.hardened;
        entry.cwd = cwd;
        self.audit.record_or_warn(&entry);

        Ok(assessed)
    }

    /// Explains `command`. No safety assessment: explaining never executes.
    pub async fn explain(&self, command: &str) -> Result<String, OrchestratorError> {
        let command = command.trim();
        if command.is_empty() {
            let err = OrchestratorError::EmptyCommand;
            self.record_failure(EventKind::Explained, None, None, None, &err);
            return Err(err);
        }

        info!("Explaining via {}: {}", self.provider.name(), command);
        let timeout = self.settings.provider_timeout;
        match with_deadline(timeout, self.provider.explain_command(command, timeout)).await {
            Ok(explanation) => {
                let mut entry = self.audit.entry(EventKind::Explained, self.provider.name());
                entry.command_text = Some(command.to_string());
                self.audit.record_or_warn(&entry);
                Ok(explanation)
            }
            Err(err) => {
                warn!("Provider {} failed to explain: {}", self.provider.name(), err);
                let err = OrchestratorError::from(err);
                self.record_failure(EventKind::Explained, None, Some(command), None, &err);
                Err(err)
            }
        }
    }

    /// Records an `executed` event reported by the shell widget.
    ///
    /// Unlike the other operations the audit write is the whole point here,
    /// so its failure is returned.
    pub fn record_execution(&self, report: &ExecutionReport) -> Result<(), OrchestratorError> {
        let command = report.command.trim();
        if command.is_empty() {
            return Err(OrchestratorError::EmptyCommand);
        }

        let goal = report.goal.as_deref().unwrap_or("");
        let assessed = self.safety.assess(CandidateCommand::new(command, goal));
        let mut entry = self.audit.entry(EventKind::Executed, self.provider.name());
        entry.goal = report.goal.clone();
        entry.command_text = Some(command.to_string());
        entry.risk_tier = Some(assessed.risk_tier);
        entry.risk_score = Some(assessed.risk_score);
        entry.cwd = report.cwd.clone();
        entry.approved = Some(report.approved);
        entry.exit_code = report.exit_code;

        info!(
            "Execution reported: '{}' approved={} exit={:?}",
            command, report.approved, report.exit_code
        );
        self.audit
            .record(&entry)
            .map_err(|e| OrchestratorError::Internal(e.to_string()))
    }

    fn validate_goal(&self, goal: &str) -> Result<(), OrchestratorError> {
        if goal.is_empty() {
            return Err(OrchestratorError::EmptyGoal);
        }
        let len = goal.chars().count();
        if len > self.settings.max_goal_chars {
            return Err(OrchestratorError::GoalTooLong {
                len,
                max: self.settings.max_goal_chars,
            });
        }
        Ok(())
    }

    /// Runs the collector on the blocking pool under the context deadline,
    /// degrading to directory + shell only when it does not finish in time.
    async fn collect_context(&self, origin: &RequestOrigin) -> ContextSnapshot {
        let cwd = origin
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let shell = origin.shell.clone();
        let fallback = ContextSnapshot::minimal(cwd.clone(), detect_shell(shell.as_deref()));

        let collector = self.collector.clone();
        let max_entries = self.settings.max_context_entries;
        let task = tokio::task::spawn_blocking(move || {
            collector.collect_in(&cwd, shell.as_deref(), max_entries)
        });

        match tokio::time::timeout(self.settings.context_timeout, task).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!("Context collection panicked: {}", e);
                fallback
            }
            Err(_) => {
                warn!(
                    "Context collection exceeded {:?}, using minimal context",
                    self.settings.context_timeout
                );
                fallback
            }
        }
    }

    fn record_failure(
        &self,
        kind: EventKind,
        goal: Option<&str>,
        command: Option<&str>,
        cwd: Option<String>,
        err: &OrchestratorError,
    ) {
        let mut entry: AuditEntry = self.audit.entry(kind, self.provider.name());
        entry.goal = goal.map(str::to_string);
        entry.command_text = command.map(str::to_string);
        entry.cwd = cwd;
        entry.outcome = Outcome::Error {
            error_kind: err.kind().to_string(),
            message: err.to_string(),
        };
        self.audit.record_or_warn(&entry);
    }
}
