//! Ollama-backed shell agent for SWE-bench evaluation
//!
//! Implements the harness's `AgentBackend` contract over a local
//! OpenAI-compatible chat endpoint: one fenced bash command per
//! assistant turn, executed in the workspace, observed back through
//! the protocol templates.

pub mod backend;
pub mod endpoint;
pub mod shell;
pub mod templates;
pub mod variant;

pub use backend::{OllamaBackend, OllamaBackendFactory};
pub use endpoint::AgentEndpoint;
pub use shell::LocalShell;
pub use variant::VariantConfig;
