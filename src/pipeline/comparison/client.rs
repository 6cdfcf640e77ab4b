use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::context::AnalysisContext;
use super::traits::{RawResponse, ReasoningEngine};
use super::ReasoningFailure;
use crate::config::{AppConfig, ConfigError, CredentialState};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chat-completions client for an OpenAI-compatible endpoint.
///
/// Attaches a bearer token only when the credential is `Configured`;
/// otherwise requests go out unauthenticated.
pub struct HttpReasoningClient {
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    credential: CredentialState,
    client: reqwest::blocking::Client,
}

impl HttpReasoningClient {
    pub fn new(
        endpoint: &str,
        model: &str,
        credential: CredentialState,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.trim().to_string(),
            model: model.to_string(),
            temperature,
            max_tokens,
            credential,
            client,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Self::new(
            &config.reasoning_endpoint,
            &config.model_identifier,
            config.credential.clone(),
            config.temperature,
            config.max_tokens,
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential.bearer().is_some()
    }
}

/// Request body for /chat/completions
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Response body from /chat/completions
#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: Option<u32>,
}

/// Map a non-success HTTP status to a failure. `None` for 2xx.
pub fn classify_status(status: u16, body: &str) -> Option<ReasoningFailure> {
    match status {
        200..=299 => None,
        401 | 403 => Some(ReasoningFailure::Unauthorized { status }),
        429 => Some(ReasoningFailure::RateLimited),
        408 => Some(ReasoningFailure::Timeout(format!("engine returned status {status}"))),
        _ => Some(ReasoningFailure::ServerError {
            status: Some(status),
            body: body.chars().take(500).collect(),
        }),
    }
}

fn classify_transport(e: &reqwest::Error, timeout: Duration) -> ReasoningFailure {
    if e.is_timeout() {
        ReasoningFailure::Timeout(format!("no response within {}ms", timeout.as_millis()))
    } else if e.is_connect() {
        ReasoningFailure::NetworkError(format!("connection failed: {e}"))
    } else if e.is_decode() || e.is_body() {
        ReasoningFailure::ServerError {
            status: None,
            body: format!("unreadable response: {e}"),
        }
    } else {
        ReasoningFailure::NetworkError(e.to_string())
    }
}

impl ReasoningEngine for HttpReasoningClient {
    fn complete(
        &self,
        context: &AnalysisContext,
        timeout: Duration,
    ) -> Result<RawResponse, ReasoningFailure> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &context.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &context.user_prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut request = self.client.post(&self.endpoint).timeout(timeout).json(&body);
        if let Some(token) = self.credential.bearer() {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|e| classify_transport(&e, timeout))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status, &body).unwrap_or(ReasoningFailure::ServerError {
                status: Some(status),
                body,
            }));
        }

        let parsed: ChatResponse = response.json().map_err(|e| classify_transport(&e, timeout))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ReasoningFailure::ServerError {
                status: Some(status),
                body: "response carried no message content".into(),
            })?;

        Ok(RawResponse {
            text,
            model: parsed.model,
            tokens_used: parsed.usage.and_then(|u| u.total_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReportKind;
    use crate::pipeline::comparison::templates::TemplateId;
    use chrono::NaiveDate;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;
    use uuid::Uuid;

    fn context() -> AnalysisContext {
        AnalysisContext {
            patient_id: "P001".into(),
            report_kind: ReportKind::RoutineLab,
            template: TemplateId::LabIndicatorDrift,
            standalone: true,
            system_prompt: "system".into(),
            user_prompt: "<CURRENT REPORT>\n</CURRENT REPORT>\n".into(),
            current_report_ref: Uuid::new_v4(),
            current_report_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            prior_report: None,
            historical_refs: vec![],
            truncated: false,
        }
    }

    /// Serve one HTTP response after `delay`, returning the raw request text.
    fn serve_once(status: &'static str, body: &'static str, delay: Duration) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/v1/chat/completions", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            std::thread::sleep(delay);
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            request
        });
        (url, handle)
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn client(url: &str, credential: CredentialState) -> HttpReasoningClient {
        HttpReasoningClient::new(url, "llama3.1", credential, 0.7, 2000).unwrap()
    }

    const OK_BODY: &str = r###"{"model":"llama3.1:8b","choices":[{"message":{"role":"assistant","content":"## Trends\n- Stable"}}],"usage":{"prompt_tokens":100,"completion_tokens":20,"total_tokens":120}}"###;

    #[test]
    fn classify_status_mapping() {
        assert_eq!(classify_status(200, ""), None);
        assert_eq!(
            classify_status(401, ""),
            Some(ReasoningFailure::Unauthorized { status: 401 })
        );
        assert_eq!(
            classify_status(403, ""),
            Some(ReasoningFailure::Unauthorized { status: 403 })
        );
        assert_eq!(classify_status(429, ""), Some(ReasoningFailure::RateLimited));
        assert!(matches!(classify_status(408, ""), Some(ReasoningFailure::Timeout(_))));
        assert!(matches!(
            classify_status(503, "overloaded"),
            Some(ReasoningFailure::ServerError { status: Some(503), .. })
        ));
        assert!(matches!(
            classify_status(404, "no such route"),
            Some(ReasoningFailure::ServerError { .. })
        ));
    }

    #[test]
    fn successful_completion_parses_text_model_and_tokens() {
        let (url, server) = serve_once("200 OK", OK_BODY, Duration::ZERO);
        let response = client(&url, CredentialState::Absent)
            .complete(&context(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(response.text, "## Trends\n- Stable");
        assert_eq!(response.model.as_deref(), Some("llama3.1:8b"));
        assert_eq!(response.tokens_used, Some(120));

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
        assert!(request.contains("\"role\":\"system\""));
    }

    #[test]
    fn configured_credential_sends_bearer() {
        let (url, server) = serve_once("200 OK", OK_BODY, Duration::ZERO);
        let engine = client(&url, CredentialState::Configured("sk-live-123".into()));
        assert!(engine.is_authenticated());
        engine.complete(&context(), Duration::from_secs(5)).unwrap();
        let request = server.join().unwrap();
        assert!(request.contains("Bearer sk-live-123"));
    }

    #[test]
    fn placeholder_credential_is_unauthenticated() {
        let (url, server) = serve_once("200 OK", OK_BODY, Duration::ZERO);
        let engine = client(&url, CredentialState::PlaceholderUnset);
        assert!(!engine.is_authenticated());
        engine.complete(&context(), Duration::from_secs(5)).unwrap();
        let request = server.join().unwrap();
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[test]
    fn unauthorized_status_maps_to_unauthorized() {
        let (url, server) = serve_once("401 Unauthorized", r#"{"error":"bad key"}"#, Duration::ZERO);
        let err = client(&url, CredentialState::Absent)
            .complete(&context(), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err, ReasoningFailure::Unauthorized { status: 401 });
        server.join().unwrap();
    }

    #[test]
    fn server_error_status_maps_to_server_error() {
        let (url, server) = serve_once("500 Internal Server Error", r#"{"error":"boom"}"#, Duration::ZERO);
        let err = client(&url, CredentialState::Absent)
            .complete(&context(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ReasoningFailure::ServerError { status: Some(500), .. }));
        server.join().unwrap();
    }

    #[test]
    fn undecodable_body_maps_to_server_error() {
        let (url, server) = serve_once("200 OK", "not json", Duration::ZERO);
        let err = client(&url, CredentialState::Absent)
            .complete(&context(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ReasoningFailure::ServerError { .. }));
        server.join().unwrap();
    }

    #[test]
    fn empty_choices_maps_to_server_error() {
        let (url, server) = serve_once("200 OK", r#"{"choices":[]}"#, Duration::ZERO);
        let err = client(&url, CredentialState::Absent)
            .complete(&context(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ReasoningFailure::ServerError { .. }));
        server.join().unwrap();
    }

    #[test]
    fn slow_engine_maps_to_timeout() {
        let (url, server) = serve_once("200 OK", OK_BODY, Duration::from_millis(1500));
        let err = client(&url, CredentialState::Absent)
            .complete(&context(), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, ReasoningFailure::Timeout(_)), "got {err:?}");
        server.join().unwrap();
    }

    #[test]
    fn refused_connection_maps_to_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/v1/chat/completions", listener.local_addr().unwrap());
        drop(listener);
        let err = client(&url, CredentialState::Absent)
            .complete(&context(), Duration::from_secs(2))
            .unwrap_err();
        assert!(matches!(err, ReasoningFailure::NetworkError(_)), "got {err:?}");
    }
}
