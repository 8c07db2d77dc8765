//! Optional LLM cleanup of extracted text.
//!
//! Refinement is best-effort. We make at most one request per call, bounded
//! by a timeout, and if anything goes wrong the caller falls back to the
//! normalized text. [`RefineOutcome`] keeps "we chose not to refine" apart from
//! "refinement failed", so both can be logged and tested.

use std::time::Duration;

use serde_json::Map;
use tokio::time;

use crate::{normalize::normalize, prelude::*, prompt::ChatPrompt};

/// The default refinement prompt, used if no prompt is provided.
const DEFAULT_REFINE_PROMPT: &str = include_str!("refine/default_refine_prompt.toml");

/// Get our default refinement prompt.
pub fn default_refine_prompt() -> ChatPrompt {
    ChatPrompt::from_toml(DEFAULT_REFINE_PROMPT)
        .expect("failed to parse built-in refinement prompt")
}

/// Settings for a [`Refiner`].
#[derive(Debug, Clone)]
pub struct RefinerConfig {
    /// Base URL of an OpenAI-compatible API, such as `https://api.openai.com/v1`.
    /// If this is `None`, refinement is disabled.
    pub api_base: Option<String>,

    /// Bearer token for the API, if it needs one.
    pub api_key: Option<String>,

    /// The model to ask.
    pub model: String,

    /// Upper bound for the whole request.
    pub timeout: Duration,

    /// The prompt. Must use a `text` binding.
    pub prompt: ChatPrompt,
}

/// What happened when we asked for refinement.
#[derive(Debug)]
pub enum RefineOutcome {
    /// The service returned cleaned-up text.
    Refined(String),
    /// We didn't call the service.
    Declined { reason: String },
    /// We called the service and it didn't work out.
    Failed(anyhow::Error),
}

impl RefineOutcome {
    /// The refined text, or else the normalized version of `original`.
    pub fn into_text(self, original: &str) -> String {
        match self {
            RefineOutcome::Refined(text) => text,
            RefineOutcome::Declined { .. } | RefineOutcome::Failed(_) => normalize(original),
        }
    }
}

/// An OpenAI-compatible chat completion request.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Value,
    temperature: f32,
}

/// The parts of a chat completion response that we care about.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    content: Option<String>,
}

/// Client for the refinement service.
#[derive(Debug, Clone)]
pub struct Refiner {
    config: RefinerConfig,
    client: reqwest::Client,
}

impl Refiner {
    /// Create a new refiner.
    pub fn new(config: RefinerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Ask the service to clean up `text`.
    ///
    /// Never fails: see [`RefineOutcome`].
    #[instrument(level = "debug", skip_all, fields(model = %self.config.model))]
    pub async fn refine(&self, text: &str) -> RefineOutcome {
        let Some(api_base) = self.config.api_base.as_deref() else {
            return RefineOutcome::Declined {
                reason: "no refinement API configured".to_owned(),
            };
        };
        if text.trim().is_empty() {
            return RefineOutcome::Declined {
                reason: "nothing to refine".to_owned(),
            };
        }

        let request = self.request_completion(api_base, text);
        let result = match time::timeout(self.config.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "refinement timed out after {} seconds",
                self.config.timeout.as_secs_f32()
            )),
        };
        match result {
            Ok(refined) => RefineOutcome::Refined(refined),
            Err(err) => {
                warn!("Refinement failed, using normalized text: {:#}", err);
                RefineOutcome::Failed(err)
            }
        }
    }

    /// Make exactly one chat completion request.
    async fn request_completion(&self, api_base: &str, text: &str) -> Result<String> {
        let mut bindings = Map::new();
        bindings.insert("text".to_owned(), Value::String(text.to_owned()));
        let messages = self.config.prompt.render_messages(&bindings)?;

        let mut url = api_base.to_owned();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str("chat/completions");

        let mut request = self.client.post(&url).json(&ChatCompletionRequest {
            model: &self.config.model,
            messages,
            temperature: 0.0,
        });
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .await
            .context("cannot reach refinement service")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "refinement service returned {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            ));
        }
        let response = response
            .json::<ChatCompletionResponse>()
            .await
            .context("cannot parse refinement response")?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_owned())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(anyhow!("refinement service returned no text"));
        }
        trace!(%content, "Refined text");
        Ok(content)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
    };

    use super::*;

    fn config(api_base: Option<String>) -> RefinerConfig {
        RefinerConfig {
            api_base,
            api_key: Some("sk-test".to_owned()),
            model: "test-model".to_owned(),
            timeout: Duration::from_secs(5),
            prompt: default_refine_prompt(),
        }
    }

    /// Serve exactly one canned HTTP response on a local port.
    pub(crate) async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/v1")
    }

    /// Read a whole HTTP request, so that closing the socket afterwards
    /// doesn't reset the connection.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut request = Vec::new();
        let mut buf = [0; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if request.len() >= header_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    #[test]
    fn default_prompt_parses() {
        let prompt = default_refine_prompt();
        assert!(prompt.developer.is_some());
        assert!(prompt.messages.last().unwrap().user.contains("{{text}}"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_back_to_normalized_text() {
        // Bind and drop a listener to get a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let refiner = Refiner::new(config(Some(format!("http://{addr}/v1"))));
        let outcome = refiner.refine("exam- ple\nword").await;
        assert!(matches!(outcome, RefineOutcome::Failed(_)), "{outcome:?}");
        assert_eq!(outcome.into_text("exam- ple\nword"), "example word");
    }

    #[tokio::test]
    async fn missing_configuration_declines() {
        let refiner = Refiner::new(config(None));
        let outcome = refiner.refine("some text").await;
        assert!(matches!(outcome, RefineOutcome::Declined { .. }));
        assert_eq!(outcome.into_text("some\ntext"), "some text");
    }

    #[tokio::test]
    async fn blank_text_declines() {
        let refiner = Refiner::new(config(Some("http://127.0.0.1:1/v1".to_owned())));
        assert!(matches!(
            refiner.refine("  \n ").await,
            RefineOutcome::Declined { .. }
        ));
    }

    #[tokio::test]
    async fn successful_responses_are_refined() {
        let api_base = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":" The lazy dog. "}}]}"#,
        )
        .await;
        let refiner = Refiner::new(config(Some(api_base)));
        let outcome = refiner.refine("Tbe la- zy d0g.").await;
        assert!(matches!(outcome, RefineOutcome::Refined(_)), "{outcome:?}");
        assert_eq!(outcome.into_text("ignored"), "The lazy dog.");
    }

    #[tokio::test]
    async fn error_statuses_fail() {
        let api_base =
            serve_once("503 Service Unavailable", r#"{"error":"overloaded"}"#).await;
        let refiner = Refiner::new(config(Some(api_base)));
        assert!(matches!(
            refiner.refine("text").await,
            RefineOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn malformed_bodies_fail() {
        let api_base = serve_once("200 OK", r#"{"unexpected":true}"#).await;
        let refiner = Refiner::new(config(Some(api_base)));
        assert!(matches!(
            refiner.refine("text").await,
            RefineOutcome::Failed(_)
        ));
    }
}
