//! Agent endpoint configuration
//!
//! Points the backend at an OpenAI-compatible chat server (local
//! Ollama by default). Everything is overridable from the environment.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Chat-completions endpoint for the agent model.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEndpoint {
    /// Base URL including the API prefix, e.g. `http://localhost:11434/v1`.
    pub url: String,
    pub model: String,
    pub api_key: String,
}

impl Default for AgentEndpoint {
    fn default() -> Self {
        Self {
            url: std::env::var("SWE_AGENT_URL")
                .unwrap_or_else(|_| "http://localhost:11434/v1".into()),
            model: std::env::var("SWE_AGENT_MODEL").unwrap_or_else(|_| "qwen3-coder:30b".into()),
            api_key: std::env::var("SWE_AGENT_API_KEY").unwrap_or_else(|_| "not-needed".into()),
        }
    }
}

impl AgentEndpoint {
    pub fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.url.trim_end_matches('/'))
    }
}

/// Check that the endpoint is reachable and serving models.
///
/// Queries `GET /models`. Reachability only; a run can still fail later
/// if the configured model is missing.
pub async fn check_endpoint(endpoint: &AgentEndpoint) -> bool {
    let models_url = format!("{}/models", endpoint.url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let mut req = client.get(&models_url).timeout(Duration::from_secs(5));
    if endpoint.api_key != "not-needed" {
        req = req.bearer_auth(&endpoint.api_key);
    }

    match req.send().await {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            warn!(
                endpoint = %endpoint.url,
                status = %resp.status(),
                "endpoint returned non-success status"
            );
            false
        }
        Err(e) => {
            warn!(endpoint = %endpoint.url, error = %e, "endpoint unreachable");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url_joins_cleanly() {
        let ep = AgentEndpoint {
            url: "http://localhost:11434/v1/".to_string(),
            model: "m".to_string(),
            api_key: "not-needed".to_string(),
        };
        assert_eq!(ep.chat_url(), "http://localhost:11434/v1/chat/completions");
    }
}
