//! E2B cloud provider.
//!
//! Two HTTP surfaces are involved:
//! - the control plane (`api_url`), authenticated with `X-API-Key`, which
//!   creates, looks up and deletes sandboxes;
//! - the agent running inside each sandbox (`https://49983-<id>.<domain>`),
//!   which serves file I/O over plain HTTP and process execution over the
//!   Connect protocol (server streaming, JSON codec).

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{stream, StreamExt, TryStreamExt};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    ByteStream, CommandApi, CreateRequest, FileContent, FilesystemApi, Process, ProcessEvent,
    ProviderError, RemoteSandbox, SandboxProvider, Utf8Decoder,
};
use crate::config::{E2bConfig, E2B_API_KEY_ENV};

/// Port the in-sandbox agent listens on.
const ENVD_PORT: u16 = 49983;
/// Unix user commands and file operations run as.
const SANDBOX_USER: &str = "user";
/// Connect envelope flag marking the trailing end-of-stream message.
const END_STREAM_FLAG: u8 = 0x02;

/// Provider for E2B cloud sandboxes.
pub(crate) struct E2bProvider {
    config: E2bConfig,
    api_key: Option<String>,
    http: Client,
}

impl E2bProvider {
    pub(crate) fn new(config: E2bConfig) -> Result<Self> {
        let api_key = config.resolve_api_key();
        Self::with_key(config, api_key)
    }

    fn with_key(config: E2bConfig, api_key: Option<String>) -> Result<Self> {
        // No client-wide timeout: process output streams stay open for the
        // whole command. Control plane calls set their own.
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            api_key,
            http,
        })
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::missing_credentials(
                "E2B",
                format!("set {E2B_API_KEY_ENV} or [e2b].api_key in sandman.toml"),
            )
        })
    }

    fn control(&self, method: Method, path: &str) -> Result<RequestBuilder, ProviderError> {
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        Ok(self
            .http
            .request(method, url)
            .header("X-API-Key", self.api_key()?)
            .timeout(Duration::from_secs(self.config.request_timeout_secs)))
    }

    fn sandbox(&self, info: SandboxInfo) -> Arc<dyn RemoteSandbox> {
        let domain = info.domain.unwrap_or_else(|| self.config.domain.clone());
        Arc::new(E2bSandbox {
            envd: Envd {
                http: self.http.clone(),
                base_url: format!("https://{ENVD_PORT}-{}.{domain}", info.sandbox_id),
                access_token: info.envd_access_token,
            },
            id: info.sandbox_id,
            domain,
            control: self.control_handle(),
        })
    }

    fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            http: self.http.clone(),
            api_url: self.config.api_url.trim_end_matches('/').to_string(),
            api_key: self.api_key.clone(),
            timeout: Duration::from_secs(self.config.request_timeout_secs),
        }
    }
}

/// Control plane view of a sandbox.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxInfo {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    envd_access_token: Option<String>,
}

#[async_trait]
impl SandboxProvider for E2bProvider {
    fn name(&self) -> &'static str {
        "e2b"
    }

    async fn create(&self, request: &CreateRequest) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let response = self
            .control(Method::POST, "/sandboxes")?
            .json(&json!({
                "templateID": self.config.template,
                "timeout": request.timeout.as_secs(),
            }))
            .send()
            .await?;

        let info: SandboxInfo = error_for_status(response).await?.json().await?;
        debug!("E2B created sandbox {}", info.sandbox_id);
        Ok(self.sandbox(info))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let response = self
            .control(Method::GET, &format!("/sandboxes/{sandbox_id}"))?
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::unavailable(format!("Sandbox {sandbox_id} not found")));
        }

        let info: SandboxInfo = error_for_status(response).await?.json().await?;
        if info.state.as_deref() == Some("paused") {
            return Err(ProviderError::unavailable(format!("Sandbox {sandbox_id} is paused")));
        }
        Ok(self.sandbox(info))
    }
}

/// Turns an error status into [`ProviderError::Api`] with the response body as message.
async fn error_for_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::api(status.as_u16(), api_message(&body)))
}

/// Pulls `message` out of a JSON error body, falling back to the raw text.
fn api_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Clone)]
struct ControlHandle {
    http: Client,
    api_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

/// Client for the in-sandbox agent.
#[derive(Clone)]
struct Envd {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl Envd {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(SANDBOX_USER, None::<&str>);
        match &self.access_token {
            Some(token) => builder.header("X-Access-Token", token),
            None => builder,
        }
    }
}

struct E2bSandbox {
    id: String,
    domain: String,
    envd: Envd,
    control: ControlHandle,
}

#[async_trait]
impl RemoteSandbox for E2bSandbox {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    fn commands(&self) -> Option<Arc<dyn CommandApi>> {
        Some(Arc::new(E2bCommands {
            envd: self.envd.clone(),
        }))
    }

    async fn filesystem(&self) -> Option<Arc<dyn FilesystemApi>> {
        let ready = self
            .envd
            .request(Method::GET, "/health")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|response| response.status().is_success());

        ready.then(|| {
            Arc::new(E2bFilesystem {
                envd: self.envd.clone(),
            }) as Arc<dyn FilesystemApi>
        })
    }

    async fn hostname(&self, port: u16) -> Result<String, ProviderError> {
        Ok(format!("{port}-{}.{}", self.id, self.domain))
    }

    async fn kill(&self) -> Result<(), ProviderError> {
        let api_key = self.control.api_key.as_deref().ok_or_else(|| {
            ProviderError::missing_credentials("E2B", format!("set {E2B_API_KEY_ENV}"))
        })?;
        let response = self
            .control
            .http
            .delete(format!("{}/sandboxes/{}", self.control.api_url, self.id))
            .header("X-API-Key", api_key)
            .timeout(self.control.timeout)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::unavailable(format!("Sandbox {} not found", self.id)));
        }
        error_for_status(response).await.map(|_| ())
    }
}

struct E2bCommands {
    envd: Envd,
}

#[async_trait]
impl CommandApi for E2bCommands {
    async fn spawn(&self, argv: &[String]) -> Result<Process, ProviderError> {
        if argv.is_empty() {
            return Err(ProviderError::spawn("empty command"));
        }
        let line = shell_words::join(argv);
        let body = json!({
            "process": {
                "cmd": "/bin/bash",
                "args": ["-l", "-c", line],
            }
        });
        let payload = serde_json::to_vec(&body)
            .map_err(|e| ProviderError::spawn(format!("Failed to encode request: {e}")))?;

        let response = self
            .envd
            .request(Method::POST, "/process.Process/Start")
            .header("Content-Type", "application/connect+json")
            .header("Connect-Protocol-Version", "1")
            .body(envelope(0, &payload))
            .send()
            .await
            .map_err(|e| ProviderError::spawn(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::spawn(format!("{status}: {}", api_message(&body))));
        }

        let mut items = process_stream(response);
        let (pid, pending) = match items.next().await {
            Some(Ok(StreamItem::Started(pid))) => (Some(pid.to_string()), None),
            Some(Ok(StreamItem::Event(event))) => (None, Some(event)),
            Some(Err(e)) => return Err(ProviderError::spawn(e.to_string())),
            None => return Err(ProviderError::spawn("process stream closed before start")),
        };

        let rest = items.try_filter_map(|item| async move {
            Ok(match item {
                StreamItem::Event(event) => Some(event),
                StreamItem::Started(_) => None,
            })
        });
        let events = stream::iter(pending.map(Ok)).chain(rest).boxed();

        Ok(Process { pid, events })
    }
}

/// Wraps a message in a Connect envelope: flags byte, big-endian length, payload.
fn envelope(flags: u8, payload: &[u8]) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(flags);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// One decoded Connect envelope.
#[derive(Debug, PartialEq, Eq)]
struct Frame {
    flags: u8,
    payload: Vec<u8>,
}

impl Frame {
    fn is_end_stream(&self) -> bool {
        self.flags & END_STREAM_FLAG != 0
    }
}

/// Reassembles envelopes from arbitrarily split body chunks.
#[derive(Debug, Default)]
struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.buf.len() >= 5 {
            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
            if self.buf.len() < 5 + len {
                break;
            }
            let flags = self.buf[0];
            let payload = self.buf[5..5 + len].to_vec();
            self.buf.drain(..5 + len);
            frames.push(Frame { flags, payload });
        }

        frames
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    event: Option<EventMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct EventMessage {
    #[serde(default)]
    start: Option<StartEvent>,
    #[serde(default)]
    data: Option<DataEvent>,
    #[serde(default)]
    end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
struct StartEvent {
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct DataEvent {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndEvent {
    // Omitted by the JSON codec when zero
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndOfStream {
    #[serde(default)]
    error: Option<EndOfStreamError>,
}

#[derive(Debug, Deserialize)]
struct EndOfStreamError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, PartialEq, Eq)]
enum StreamItem {
    Started(u32),
    Event(ProcessEvent),
}

/// Per-stream decoding state for one process.
#[derive(Default)]
struct OutputDecoders {
    stdout: Utf8Decoder,
    stderr: Utf8Decoder,
}

/// Decodes one data message into zero or more stream items.
fn decode_message(payload: &[u8], decoders: &mut OutputDecoders) -> Result<Vec<StreamItem>, ProviderError> {
    let message: StartResponse = serde_json::from_slice(payload)
        .map_err(|e| ProviderError::connection(format!("Malformed process event: {e}")))?;
    let Some(event) = message.event else {
        return Ok(Vec::new());
    };

    let mut items = Vec::new();
    if let Some(start) = event.start {
        items.push(StreamItem::Started(start.pid));
    }
    if let Some(data) = event.data {
        if let Some(encoded) = data.stdout {
            let text = decoders.stdout.push(&decode_base64(&encoded)?);
            if !text.is_empty() {
                items.push(StreamItem::Event(ProcessEvent::Stdout(text)));
            }
        }
        if let Some(encoded) = data.stderr {
            let text = decoders.stderr.push(&decode_base64(&encoded)?);
            if !text.is_empty() {
                items.push(StreamItem::Event(ProcessEvent::Stderr(text)));
            }
        }
    }
    if let Some(end) = event.end {
        let decoders = std::mem::take(decoders);
        let (out, err) = (decoders.stdout.finish(), decoders.stderr.finish());
        if !out.is_empty() {
            items.push(StreamItem::Event(ProcessEvent::Stdout(out)));
        }
        if !err.is_empty() {
            items.push(StreamItem::Event(ProcessEvent::Stderr(err)));
        }
        let code = end.exit_code;
        items.push(StreamItem::Event(ProcessEvent::Exit {
            code,
            status: end.status.unwrap_or_else(|| format!("exit status {code}")),
        }));
    }
    Ok(items)
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, ProviderError> {
    BASE64
        .decode(encoded)
        .map_err(|e| ProviderError::connection(format!("Malformed process output: {e}")))
}

/// Checks the trailing end-of-stream message for an error.
fn check_end_of_stream(payload: &[u8]) -> Result<(), ProviderError> {
    let end: EndOfStream = serde_json::from_slice(payload).unwrap_or(EndOfStream { error: None });
    match end.error {
        Some(error) if error.code == "not_found" => Err(ProviderError::unavailable(error.message)),
        Some(error) => Err(ProviderError::connection(format!(
            "{}: {}",
            error.code, error.message
        ))),
        None => Ok(()),
    }
}

fn process_stream(
    response: Response,
) -> futures_util::stream::BoxStream<'static, Result<StreamItem, ProviderError>> {
    let mut body = Box::pin(response.bytes_stream());

    async_stream::try_stream! {
        let mut frames = FrameDecoder::default();
        let mut decoders = OutputDecoders::default();

        'body: while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ProviderError::connection(e.to_string()))?;
            for frame in frames.push(&chunk) {
                if frame.is_end_stream() {
                    check_end_of_stream(&frame.payload)?;
                    break 'body;
                }
                for item in decode_message(&frame.payload, &mut decoders)? {
                    yield item;
                }
            }
        }
    }
    .boxed()
}

struct E2bFilesystem {
    envd: Envd,
}

#[async_trait]
impl FilesystemApi for E2bFilesystem {
    async fn write(&self, path: &str, content: FileContent) -> Result<(), ProviderError> {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let part = reqwest::multipart::Part::bytes(content.into_bytes().to_vec()).file_name(name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .envd
            .request(Method::POST, "/files")
            .query(&[("path", path), ("username", SANDBOX_USER)])
            .multipart(form)
            .send()
            .await?;
        error_for_status(response).await.map(|_| ())
    }

    async fn read(&self, path: &str) -> Result<ByteStream, ProviderError> {
        let response = self
            .envd
            .request(Method::GET, "/files")
            .query(&[("path", path), ("username", SANDBOX_USER)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::file_not_found(path));
        }
        let response = error_for_status(response).await?;
        Ok(response.bytes_stream().map_err(ProviderError::from).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(value: &serde_json::Value) -> Vec<u8> {
        envelope(0, &serde_json::to_vec(value).unwrap())
    }

    #[test]
    fn test_envelope_layout() {
        let framed = envelope(0, b"{}");
        assert_eq!(framed, vec![0, 0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn test_frame_decoder_reassembles_split_chunks() {
        let mut bytes = data_frame(&json!({"event": {"start": {"pid": 7}}}));
        bytes.extend(envelope(END_STREAM_FLAG, b"{}"));

        let mut decoder = FrameDecoder::default();
        let mut frames = decoder.push(&bytes[..3]);
        assert!(frames.is_empty());
        frames.extend(decoder.push(&bytes[3..]));

        assert_eq!(frames.len(), 2);
        assert!(!frames[0].is_end_stream());
        assert!(frames[1].is_end_stream());
    }

    #[test]
    fn test_decode_start_data_end() {
        let mut decoders = OutputDecoders::default();

        let start = decode_message(br#"{"event":{"start":{"pid":42}}}"#, &mut decoders).unwrap();
        assert_eq!(start, vec![StreamItem::Started(42)]);

        let payload = serde_json::to_vec(&json!({
            "event": {"data": {"stdout": BASE64.encode("hello\n")}}
        }))
        .unwrap();
        let data = decode_message(&payload, &mut decoders).unwrap();
        assert_eq!(
            data,
            vec![StreamItem::Event(ProcessEvent::Stdout("hello\n".to_string()))]
        );

        let end = decode_message(
            br#"{"event":{"end":{"exitCode":3,"exited":true,"status":"exit status 3"}}}"#,
            &mut decoders,
        )
        .unwrap();
        assert_eq!(
            end,
            vec![StreamItem::Event(ProcessEvent::Exit {
                code: 3,
                status: "exit status 3".to_string()
            })]
        );
    }

    #[test]
    fn test_decode_end_with_omitted_zero_code() {
        let mut decoders = OutputDecoders::default();
        let end = decode_message(br#"{"event":{"end":{"exited":true}}}"#, &mut decoders).unwrap();
        assert_eq!(
            end,
            vec![StreamItem::Event(ProcessEvent::Exit {
                code: 0,
                status: "exit status 0".to_string()
            })]
        );
    }

    #[test]
    fn test_keepalive_is_ignored() {
        let mut decoders = OutputDecoders::default();
        let items = decode_message(br#"{"event":{"keepalive":{}}}"#, &mut decoders).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_end_of_stream_errors() {
        assert!(check_end_of_stream(b"{}").is_ok());

        let err = check_end_of_stream(br#"{"error":{"code":"not_found","message":"sandbox not found"}}"#)
            .unwrap_err();
        assert!(err.is_unavailable());

        let err = check_end_of_stream(br#"{"error":{"code":"internal","message":"boom"}}"#).unwrap_err();
        assert_eq!(err.to_string(), "Connection failed: internal: boom");
    }

    #[test]
    fn test_api_message() {
        assert_eq!(api_message(r#"{"code":401,"message":"Invalid API key"}"#), "Invalid API key");
        assert_eq!(api_message("bad gateway\n"), "bad gateway");
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let provider = E2bProvider::with_key(E2bConfig::default(), None).unwrap();
        let request = CreateRequest {
            timeout: Duration::from_secs(600),
            ports: vec![],
        };

        let err = provider.create(&request).await.err().unwrap();
        assert!(err.is_missing_credentials());

        let err = provider.connect("sbx123").await.err().unwrap();
        assert!(err.is_missing_credentials());
    }

    #[tokio::test]
    async fn test_hostname_format() {
        let provider = E2bProvider::with_key(E2bConfig::default(), Some("key".to_string())).unwrap();
        let sandbox = provider.sandbox(SandboxInfo {
            sandbox_id: "sbx123".to_string(),
            state: Some("running".to_string()),
            domain: None,
            envd_access_token: None,
        });

        assert_eq!(sandbox.hostname(3000).await.unwrap(), "3000-sbx123.e2b.app");
    }
}
