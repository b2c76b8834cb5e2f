//! Ollama-compatible agent backend
//!
//! One chat conversation per run: the model proposes one bash action
//! per turn, the shell executes it, and the rendered observation goes
//! back. Every message passes through the driver's observer before it
//! is appended; an abort directive ends the run with "LoopAborted".

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use harness::driver::{AgentBackend, AgentOutcome, BackendFactory, Role, TranscriptObserver};
use harness::{EvalError, EvalResult};

use crate::endpoint::AgentEndpoint;
use crate::shell::LocalShell;
use crate::templates::{
    build_format_error, build_observation, build_timeout_observation, extract_bash_blocks,
    render_instance, SUBMIT_SENTINEL, SYSTEM_TEMPLATE,
};

/// Provider-side request deadline per model call.
const MODEL_CALL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, serde::Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

/// One-run agent over an OpenAI-compatible chat endpoint.
pub struct OllamaBackend {
    endpoint: AgentEndpoint,
    http: reqwest::Client,
    shell: LocalShell,
    step_limit: u32,
    cost_limit: f64,
    tdd_mode: bool,
    messages: Vec<ChatMessage>,
    n_calls: u32,
    cost: f64,
}

impl OllamaBackend {
    pub fn new(
        endpoint: AgentEndpoint,
        workspace: &Path,
        step_limit: u32,
        cost_limit: f64,
        tdd_mode: bool,
        action_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            http: reqwest::Client::new(),
            shell: LocalShell::new(workspace).with_timeout(action_timeout),
            step_limit,
            cost_limit,
            tdd_mode,
            messages: Vec::new(),
            n_calls: 0,
            cost: 0.0,
        }
    }

    /// One model call. Connection-level failures are transient; the
    /// driver owns the retry policy.
    async fn query(&mut self) -> EvalResult<String> {
        let payload = json!({
            "model": self.endpoint.model,
            "messages": &self.messages,
            "temperature": 0.0,
            "max_tokens": 8192,
            "stream": false,
        });

        let mut req = self
            .http
            .post(self.endpoint.chat_url())
            .json(&payload)
            .timeout(MODEL_CALL_TIMEOUT);
        if self.endpoint.api_key != "not-needed" {
            req = req.bearer_auth(&self.endpoint.api_key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                EvalError::transient(format!("model endpoint: {e}"))
            } else {
                EvalError::agent(format!("model endpoint: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(300).collect();
            // Gateway hiccups and throttling deserve a retry; anything
            // else is a real rejection.
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(EvalError::transient(format!("model http {status}: {excerpt}")))
            } else {
                Err(EvalError::agent(format!("model http {status}: {excerpt}")))
            };
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| EvalError::agent(format!("bad chat response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EvalError::agent("chat response had no choices"))?;

        self.n_calls += 1;
        Ok(content)
    }

    /// Observe and append a user message, honoring the directive.
    /// Returns the abort reason when the run must terminate.
    async fn push_user(
        &mut self,
        observer: &mut dyn TranscriptObserver,
        content: String,
    ) -> Option<String> {
        let directive = observer.observe(Role::User, &content).await;
        let content = if directive.warnings.is_empty() {
            content
        } else {
            format!("{}\n{content}", directive.warnings.join("\n"))
        };
        self.messages.push(ChatMessage {
            role: "user",
            content,
        });
        directive.abort
    }
}

#[async_trait]
impl AgentBackend for OllamaBackend {
    async fn run(
        &mut self,
        task: &str,
        observer: &mut dyn TranscriptObserver,
    ) -> EvalResult<AgentOutcome> {
        // A rerun after a transient failure starts the conversation over.
        self.messages.clear();

        let system = SYSTEM_TEMPLATE.to_string();
        observer.observe(Role::System, &system).await;
        self.messages.push(ChatMessage {
            role: "system",
            content: system,
        });

        let instance = render_instance(task, self.tdd_mode);
        if let Some(reason) = self.push_user(observer, instance).await {
            return Ok(AgentOutcome {
                status: "LoopAborted".to_string(),
                message: reason,
            });
        }

        loop {
            if self.n_calls >= self.step_limit {
                return Ok(AgentOutcome {
                    status: "LimitsExceeded".to_string(),
                    message: format!("step limit {} reached", self.step_limit),
                });
            }

            let reply = self.query().await?;
            debug!(step = self.n_calls, chars = reply.len(), "assistant turn");
            observer.observe(Role::Assistant, &reply).await;
            self.messages.push(ChatMessage {
                role: "assistant",
                content: reply.clone(),
            });

            let actions = extract_bash_blocks(&reply);
            if actions.len() != 1 {
                let obs = build_format_error(actions.len());
                if let Some(reason) = self.push_user(observer, obs).await {
                    return Ok(AgentOutcome {
                        status: "LoopAborted".to_string(),
                        message: reason,
                    });
                }
                continue;
            }
            let action = &actions[0];

            let observation = match self.shell.execute(action).await {
                Ok(out) if out.timed_out => build_timeout_observation(action, &out.output),
                Ok(out) => {
                    if out.output.contains(SUBMIT_SENTINEL) {
                        return Ok(AgentOutcome {
                            status: "Submitted".to_string(),
                            message: out.output,
                        });
                    }
                    build_observation(out.returncode, &out.output, self.n_calls, self.step_limit)
                }
                Err(e) => {
                    warn!("action spawn failed: {e}");
                    build_observation(
                        127,
                        &format!("failed to execute command: {e}"),
                        self.n_calls,
                        self.step_limit,
                    )
                }
            };

            if let Some(reason) = self.push_user(observer, observation).await {
                return Ok(AgentOutcome {
                    status: "LoopAborted".to_string(),
                    message: reason,
                });
            }

            if self.cost_limit > 0.0 && self.cost >= self.cost_limit {
                return Ok(AgentOutcome {
                    status: "CostLimitExceeded".to_string(),
                    message: format!("cost limit {} reached", self.cost_limit),
                });
            }
        }
    }

    fn n_calls(&self) -> u32 {
        self.n_calls
    }

    fn cost(&self) -> f64 {
        self.cost
    }
}

/// Creates a fresh backend per repair round.
pub struct OllamaBackendFactory {
    pub endpoint: AgentEndpoint,
    pub step_limit: u32,
    pub cost_limit: f64,
    pub tdd_mode: bool,
    pub action_timeout: Duration,
}

impl OllamaBackendFactory {
    pub fn new(endpoint: AgentEndpoint, step_limit: u32, cost_limit: f64, tdd_mode: bool) -> Self {
        Self {
            endpoint,
            step_limit,
            cost_limit,
            tdd_mode,
            action_timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl BackendFactory for OllamaBackendFactory {
    async fn create(&self, workspace: &Path) -> EvalResult<Box<dyn AgentBackend>> {
        Ok(Box::new(OllamaBackend::new(
            self.endpoint.clone(),
            workspace,
            self.step_limit,
            self.cost_limit,
            self.tdd_mode,
            self.action_timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness::driver::Directive;

    struct NullObserver;

    #[async_trait]
    impl TranscriptObserver for NullObserver {
        async fn observe(&mut self, _role: Role, _content: &str) -> Directive {
            Directive::default()
        }
    }

    #[tokio::test]
    async fn test_push_user_prepends_warnings() {
        struct WarningObserver;

        #[async_trait]
        impl TranscriptObserver for WarningObserver {
            async fn observe(&mut self, _role: Role, _content: &str) -> Directive {
                Directive {
                    warnings: vec!["<warning>slow down</warning>".to_string()],
                    abort: None,
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut backend = OllamaBackend::new(
            AgentEndpoint::default(),
            dir.path(),
            30,
            0.0,
            false,
            Duration::from_secs(5),
        );
        let abort = backend
            .push_user(&mut WarningObserver, "<returncode>0</returncode>".to_string())
            .await;
        assert!(abort.is_none());
        let last = backend.messages.last().unwrap();
        assert!(last.content.starts_with("<warning>slow down</warning>\n"));
        assert!(last.content.contains("<returncode>0</returncode>"));
    }

    #[tokio::test]
    async fn test_step_limit_zero_terminates_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = OllamaBackend::new(
            AgentEndpoint::default(),
            dir.path(),
            0,
            0.0,
            false,
            Duration::from_secs(5),
        );
        let outcome = backend.run("task", &mut NullObserver).await.unwrap();
        assert_eq!(outcome.status, "LimitsExceeded");
        assert_eq!(backend.n_calls(), 0);
    }
}
