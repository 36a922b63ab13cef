//! Oracle backed by an OpenAI-compatible chat completions endpoint.

use std::io::Read;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelToken, POLL_SLICE};
use crate::core::types::{ArtifactSet, GenerationRequest};
use crate::error::OracleError;
use crate::io::config::OracleConfig;
use crate::io::oracle::{Oracle, ResponseLimits, parse_artifact_response};

/// Bytes of an error response kept for the diagnostic message.
const ERROR_EXCERPT_BYTES: u64 = 4096;

const SYSTEM_PROMPT: &str = "You are a code generator. Answer with a single JSON object of the form \
{\"files\": [{\"path\": \"...\", \"content\": \"...\"}]} and nothing else.";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Blocking HTTP client for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    config: OracleConfig,
    api_key: Option<String>,
    client: Client,
}

impl HttpOracle {
    /// Reads the API key from `oracle.http.api_key_env`. An empty variable
    /// name means the endpoint needs no key.
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        let key_env = config.http.api_key_env.trim();
        let api_key = if key_env.is_empty() {
            None
        } else {
            match std::env::var(key_env) {
                Ok(key) if !key.trim().is_empty() => Some(key),
                _ => {
                    return Err(OracleError::permanent(format!(
                        "missing API key: set {key_env}"
                    )));
                }
            }
        };
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| OracleError::permanent(format!("build http client: {err}")))?;
        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.http.base_url.trim_end_matches('/')
        )
    }

    fn send(&self, prompt: &str) -> Result<String, OracleError> {
        let body = ChatRequest {
            model: &self.config.http.model,
            temperature: self.config.http.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().map_err(|err| {
            if err.is_builder() {
                OracleError::permanent(format!("build request: {err}"))
            } else {
                OracleError::transient(format!("request failed: {err}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let mut excerpt = Vec::new();
            let text = match response.take(ERROR_EXCERPT_BYTES).read_to_end(&mut excerpt) {
                Ok(_) => String::from_utf8_lossy(&excerpt).into_owned(),
                Err(err) => format!("<body unreadable: {err}>"),
            };
            warn!(status = status.as_u16(), "oracle endpoint returned an error");
            return Err(classify_status(status.as_u16(), &text, retry_after));
        }

        let limit = self.config.max_response_bytes;
        if let Some(length) = response.content_length()
            && length > limit as u64
        {
            return Err(OracleError::malformed(format!(
                "response body of {length} bytes exceeds {limit} bytes"
            )));
        }
        let bytes = read_bounded(response, limit)?;
        let text = String::from_utf8(bytes)
            .map_err(|err| OracleError::transient(format!("response body is not utf-8: {err}")))?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|err| OracleError::transient(format!("decode response body: {err}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| OracleError::transient("response has no message content"))
    }
}

/// Read at most `limit` bytes; a longer body is malformed, a failed read transient.
fn read_bounded(reader: impl Read, limit: usize) -> Result<Vec<u8>, OracleError> {
    let mut bytes = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| OracleError::transient(format!("read response body: {err}")))?;
    if bytes.len() > limit {
        return Err(OracleError::malformed(format!(
            "response body exceeds {limit} bytes"
        )));
    }
    Ok(bytes)
}

/// Map a non-success HTTP status to an oracle error class.
///
/// - 408, 429 and 5xx are transient (429 with `insufficient_quota` is not).
/// - Every other status is permanent.
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> OracleError {
    let excerpt: String = body.chars().take(300).collect();
    let message = format!("http {status}: {}", excerpt.trim());
    match status {
        429 if body.contains("insufficient_quota") => OracleError::permanent(message),
        408 | 429 | 500..=599 => OracleError::Transient {
            message,
            retry_after,
        },
        _ => OracleError::permanent(message),
    }
}

impl Oracle for HttpOracle {
    #[instrument(skip_all, fields(model = %self.config.http.model, repair = request.is_repair()))]
    fn synthesize(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<ArtifactSet, OracleError> {
        info!(endpoint = %self.endpoint(), "calling oracle endpoint");
        let (tx, rx) = mpsc::channel();
        let worker = self.clone();
        let prompt = request.prompt.clone();
        thread::spawn(move || {
            let _ = tx.send(worker.send(&prompt));
        });

        // The client timeout bounds the worker; the caller only waits while not cancelled.
        let raw = loop {
            match rx.recv_timeout(POLL_SLICE) {
                Ok(result) => break result?,
                Err(mpsc::RecvTimeoutError::Timeout) if cancel.is_cancelled() => {
                    return Err(OracleError::Cancelled);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(OracleError::transient("oracle worker stopped"));
                }
            }
        };
        debug!(bytes = raw.len(), "oracle endpoint answered");

        parse_artifact_response(&raw, &ResponseLimits::from(&self.config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    use super::*;
    use crate::io::config::{HttpOracleConfig, OracleBackend};

    #[test]
    fn classifies_statuses() {
        assert!(classify_status(500, "", None).is_transient());
        assert!(classify_status(503, "", None).is_transient());
        assert!(classify_status(408, "", None).is_transient());
        assert_eq!(
            classify_status(429, "slow down", Some(Duration::from_secs(7))),
            OracleError::Transient {
                message: "http 429: slow down".to_string(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );
        assert!(matches!(
            classify_status(429, r#"{"error":{"code":"insufficient_quota"}}"#, None),
            OracleError::Permanent { .. }
        ));
        for status in [400, 401, 403, 404, 422] {
            assert!(matches!(
                classify_status(status, "", None),
                OracleError::Permanent { .. }
            ));
        }
    }

    #[test]
    fn missing_api_key_is_permanent() {
        let config = OracleConfig {
            backend: OracleBackend::Http,
            http: HttpOracleConfig {
                api_key_env: "SVCGEN_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
                ..HttpOracleConfig::default()
            },
            ..OracleConfig::default()
        };
        let err = HttpOracle::new(config).expect_err("no key");
        assert!(err.to_string().contains("SVCGEN_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    /// Serve one canned HTTP response on a local port.
    fn serve_once(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read header");
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().expect("content length");
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).expect("read body");
            let mut stream = stream;
            write!(
                stream,
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .expect("write response");
        });
        format!("http://{addr}/v1")
    }

    fn local_oracle(base_url: String) -> HttpOracle {
        local_oracle_with(base_url, OracleConfig::default().max_response_bytes)
    }

    fn local_oracle_with(base_url: String, max_response_bytes: usize) -> HttpOracle {
        HttpOracle::new(OracleConfig {
            backend: OracleBackend::Http,
            max_response_bytes,
            timeout_secs: 10,
            http: HttpOracleConfig {
                base_url,
                api_key_env: String::new(),
                ..HttpOracleConfig::default()
            },
            ..OracleConfig::default()
        })
        .expect("oracle")
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            description: "d".to_string(),
            test_scenario: "s".to_string(),
            prior_artifact: None,
            diagnostic_history: Vec::new(),
            prompt: "write it".to_string(),
        }
    }

    #[test]
    fn parses_chat_completion_content() {
        let content = r#"{"files":[{"path":"run.sh","content":"echo ok"}]}"#;
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
        .to_string();
        let oracle = local_oracle(serve_once("HTTP/1.1 200 OK", body));
        let artifact = oracle
            .synthesize(&request(), &CancelToken::new())
            .expect("artifact");
        assert_eq!(artifact.get("run.sh"), Some("echo ok"));
    }

    #[test]
    fn server_error_is_transient() {
        let oracle = local_oracle(serve_once(
            "HTTP/1.1 503 Service Unavailable",
            r#"{"error":"overloaded"}"#.to_string(),
        ));
        let err = oracle
            .synthesize(&request(), &CancelToken::new())
            .expect_err("503");
        assert!(err.is_transient());
    }

    #[test]
    fn oversized_body_is_malformed() {
        let content = "x".repeat(2048);
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
        .to_string();
        let oracle = local_oracle_with(serve_once("HTTP/1.1 200 OK", body), 1024);
        let err = oracle
            .synthesize(&request(), &CancelToken::new())
            .expect_err("too large");
        assert!(
            matches!(err, OracleError::MalformedResponse { .. }),
            "{err:?}"
        );
        assert!(err.to_string().contains("1024"));
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
        }
    }

    #[test]
    fn bounded_read_without_length_header() {
        assert_eq!(read_bounded(&b"abcd"[..], 4).expect("fits"), b"abcd");
        assert!(matches!(
            read_bounded(&b"abcde"[..], 4),
            Err(OracleError::MalformedResponse { .. })
        ));
        assert!(read_bounded(FailingReader, 4).expect_err("reset").is_transient());
    }
}
