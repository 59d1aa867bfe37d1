//! aishell - natural-language goals to safety-vetted shell commands.
//!
//! A terminal hotkey sends a goal such as "sync my photos to the backup
//! drive" to a local daemon, which answers with one shell command line for
//! the user to review. The daemon never executes anything itself.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management (TOML file, environment overrides)
//! - [`context`] - Snapshot of the caller's directory, VCS state and shell
//! - [`provider`] - Backend-agnostic command generation contract
//! - [`openai_provider`] - API-key chat completions backend
//! - [`ollama_provider`] - Local inference backend
//! - [`safety`] - Risk scoring, blocking and dry-run hardening
//! - [`audit`] - Append-only JSON-lines audit trail
//! - [`orchestrator`] - The `suggest` / `explain` pipeline
//! - [`daemon`] - Loopback HTTP front-end
//! - [`providers`] - Shared dependency injection traits
//! - [`http_client`] - HTTP client abstraction
//!
//! # Example
//!
//! ```ignore
//! use aishell::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     aishell::daemon::serve(config).await
//! }
//! ```
//!
//! # Pipeline
//!
//! ```text
//! goal -> context snapshot -> provider -> safety gate -> audit -> response
//! ```
//!
//! Commands matching a deny rule (recursive delete of `/`, disk formatting,
//! fork bombs) come back blocked with a reason. Moderately risky commands for
//! tools with a preview mode come back with that mode switched on:
//!
//! ```text
//! rsync -av src/ dest/   ->   rsync --dry-run -av src/ dest/
//! ```

pub mod audit;
pub mod config;
pub mod context;
pub mod daemon;
pub mod http_client;
pub mod ollama_provider;
pub mod openai_provider;
pub mod orchestrator;
pub mod provider;
pub mod providers;
pub mod safety;
