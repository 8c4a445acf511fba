//! # talon-broker — the tool execution boundary
//!
//! The broker is the only component permitted to execute tool operations.
//! Every call verifies the capability token, checks that the token binds the
//! requested tool, and enforces the token's constraints before any side
//! effect happens. Validation failures never partially execute.
//!
//! Supported tools: `file.read`, `file.write`, `http.fetch`, `docker.run`.
//! `shell.exec` is refused even when presented with a matching token.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use talon_policy::{TokenError, Verifier};
use talon_protocol::{CapabilityToken, ToolIntent};

const DEFAULT_FILE_MAX_BYTES: usize = 1024 * 1024;
const DEFAULT_HTTP_MAX_BYTES: usize = 200_000;
const USER_AGENT: &str = "talon/0.1";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("capability token required")]
    TokenRequired,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),
    #[error("token tool mismatch")]
    ToolMismatch,
    #[error("no constraints on token")]
    MissingConstraints,
    #[error("invalid constraints: {0}")]
    InvalidConstraints(String),
    #[error("path required")]
    PathRequired,
    #[error("constraint roots required for file access")]
    RootsRequired,
    #[error("path {0} not under allowed roots")]
    PathOutsideRoots(String),
    #[error("file exceeds max_bytes {0}")]
    ReadTooLarge(usize),
    #[error("content exceeds max_bytes {0}")]
    WriteTooLarge(usize),
    #[error("url required")]
    UrlRequired,
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    #[error("url domain not in allowlist")]
    DomainNotAllowed,
    #[error("method {0} not in allowlist")]
    MethodNotAllowed(String),
    #[error("response exceeds max_bytes {0}")]
    ResponseTooLarge(usize),
    #[error("image required (use image@sha256:...)")]
    ImageRequired,
    #[error("docker.run only allowed with digest: image@sha256:...")]
    ImageNotPinned,
    #[error("image not in allowlist")]
    ImageNotAllowed,
    #[error("shell.exec disabled by default")]
    ShellDisabled,
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Executes one intent under one verified token.
#[async_trait]
pub trait ToolBroker: Send + Sync {
    async fn execute(
        &self,
        intent: &ToolIntent,
        token: Option<&CapabilityToken>,
    ) -> Result<Value, BrokerError>;
}

/// Resource limits applied to every `docker.run` container.
#[derive(Debug, Clone)]
pub struct DockerLimits {
    pub memory: String,
    pub cpus: String,
}

impl Default for DockerLimits {
    fn default() -> Self {
        Self {
            memory: "512m".to_owned(),
            cpus: "1.0".to_owned(),
        }
    }
}

/// Production broker. Stateless beyond its verifier, HTTP client, and docker
/// limits, all immutable after construction.
pub struct CapabilityBroker {
    verifier: Verifier,
    http: reqwest::Client,
    limits: DockerLimits,
}

impl CapabilityBroker {
    pub fn new(verifier: Verifier) -> Self {
        Self::with_limits(verifier, DockerLimits::default())
    }

    pub fn with_limits(verifier: Verifier, limits: DockerLimits) -> Self {
        Self {
            verifier,
            http: reqwest::Client::new(),
            limits,
        }
    }
}

#[async_trait]
impl ToolBroker for CapabilityBroker {
    #[instrument(skip(self, intent, token), fields(tool = %intent.tool))]
    async fn execute(
        &self,
        intent: &ToolIntent,
        token: Option<&CapabilityToken>,
    ) -> Result<Value, BrokerError> {
        let token = token.ok_or(BrokerError::TokenRequired)?;
        self.verifier.verify(token)?;
        if token.tool != intent.tool {
            return Err(BrokerError::ToolMismatch);
        }
        if token.constraints.is_null() {
            return Err(BrokerError::MissingConstraints);
        }

        debug!(cap_id = %token.cap_id, "token verified, dispatching tool");
        match intent.tool.as_str() {
            "file.read" => self.file_read(&intent.params, &token.constraints).await,
            "file.write" => self.file_write(&intent.params, &token.constraints).await,
            "http.fetch" => self.http_fetch(&intent.params, &token.constraints).await,
            "docker.run" => self.docker_run(&intent.params, &token.constraints).await,
            "shell.exec" => Err(BrokerError::ShellDisabled),
            other => Err(BrokerError::UnknownTool(other.to_owned())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileConstraints {
    roots: Option<Vec<String>>,
    #[serde(default)]
    max_bytes: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct HttpConstraints {
    #[serde(default)]
    domains: Option<Vec<String>>,
    #[serde(default)]
    methods: Option<Vec<String>>,
    #[serde(default)]
    max_bytes: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConstraints {
    #[serde(default)]
    images: Option<Vec<String>>,
}

impl CapabilityBroker {
    async fn file_read(&self, params: &Value, constraints: &Value) -> Result<Value, BrokerError> {
        let path = param_str(params, "path").ok_or(BrokerError::PathRequired)?;
        let limits: FileConstraints = parse_constraints(constraints)?;
        let roots = limits.roots.ok_or(BrokerError::RootsRequired)?;
        if !path_under_roots(path, &roots) {
            return Err(BrokerError::PathOutsideRoots(path.to_owned()));
        }
        let max_bytes = effective_max(limits.max_bytes, DEFAULT_FILE_MAX_BYTES);

        let file = tokio::fs::File::open(path).await?;
        let mut content = Vec::new();
        file.take(max_bytes as u64 + 1).read_to_end(&mut content).await?;
        if content.len() > max_bytes {
            return Err(BrokerError::ReadTooLarge(max_bytes));
        }
        Ok(json!({
            "path": path,
            "content": String::from_utf8_lossy(&content),
            "bytes": content.len(),
        }))
    }

    async fn file_write(&self, params: &Value, constraints: &Value) -> Result<Value, BrokerError> {
        let path = param_str(params, "path").ok_or(BrokerError::PathRequired)?;
        let content = params.get("content").and_then(Value::as_str).unwrap_or("");
        let limits: FileConstraints = parse_constraints(constraints)?;
        let roots = limits.roots.ok_or(BrokerError::RootsRequired)?;
        if !path_under_roots(path, &roots) {
            return Err(BrokerError::PathOutsideRoots(path.to_owned()));
        }
        let max_bytes = effective_max(limits.max_bytes, DEFAULT_FILE_MAX_BYTES);
        if content.len() > max_bytes {
            return Err(BrokerError::WriteTooLarge(max_bytes));
        }

        create_parent_dirs(Path::new(path)).await?;
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, content.as_bytes()).await?;
        Ok(json!({"path": path, "bytes": content.len()}))
    }

    async fn http_fetch(&self, params: &Value, constraints: &Value) -> Result<Value, BrokerError> {
        let url = param_str(params, "url").ok_or(BrokerError::UrlRequired)?;
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("GET");
        let limits: HttpConstraints = parse_constraints(constraints)?;

        if let Some(domains) = &limits.domains
            && !domain_allowed(url, domains)
        {
            return Err(BrokerError::DomainNotAllowed);
        }
        if let Some(methods) = &limits.methods
            && !methods.is_empty()
            && !methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        {
            return Err(BrokerError::MethodNotAllowed(method.to_owned()));
        }
        let max_bytes = effective_max(limits.max_bytes, DEFAULT_HTTP_MAX_BYTES);

        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| BrokerError::InvalidMethod(method.to_owned()))?;
        let mut response = self
            .http
            .request(method, url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;
        let status_code = response.status().as_u16();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() > max_bytes {
                return Err(BrokerError::ResponseTooLarge(max_bytes));
            }
        }
        Ok(json!({
            "status_code": status_code,
            "body": String::from_utf8_lossy(&body),
            "bytes": body.len(),
        }))
    }

    /// Run a digest-pinned image with hardened defaults. Container failures
    /// come back as a result mapping (`{error, exit, stderr}`), not a broker
    /// error — the execution itself happened and belongs in the step record.
    async fn docker_run(&self, params: &Value, constraints: &Value) -> Result<Value, BrokerError> {
        let image = param_str(params, "image").ok_or(BrokerError::ImageRequired)?;
        if !image.contains("@sha256:") {
            return Err(BrokerError::ImageNotPinned);
        }
        let limits: DockerConstraints = parse_constraints(constraints)?;
        if let Some(images) = &limits.images
            && !images.is_empty()
            && !images.iter().any(|allowed| allowed == image)
        {
            return Err(BrokerError::ImageNotAllowed);
        }

        let output = Command::new("docker")
            .args([
                "run",
                "--rm",
                "--read-only",
                "--cap-drop=ALL",
                "--security-opt",
                "no-new-privileges",
                "--pids-limit=128",
            ])
            .arg(format!("--memory={}", self.limits.memory))
            .arg(format!("--cpus={}", self.limits.cpus))
            .args([
                "--network=none",
                "--tmpfs",
                "/tmp:rw,noexec,nosuid,size=64m",
                "--workdir",
                "/work",
            ])
            .arg(image)
            .output()
            .await;

        match output {
            Ok(output) => {
                let exit = output.status.code().unwrap_or(-1);
                if output.status.success() {
                    Ok(json!({
                        "stdout": String::from_utf8_lossy(&output.stdout),
                        "exit": exit,
                    }))
                } else {
                    warn!(exit, image, "container exited non-zero");
                    Ok(json!({
                        "error": format!("docker exited with status {exit}"),
                        "exit": exit,
                        "stderr": String::from_utf8_lossy(&output.stderr),
                    }))
                }
            }
            Err(error) => {
                warn!(%error, "failed to spawn docker");
                Ok(json!({
                    "error": error.to_string(),
                    "exit": -1,
                    "stderr": "",
                }))
            }
        }
    }
}

/// Create missing parent directories with mode 0700.
async fn create_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(parent).await?;
    }
    Ok(())
}

fn param_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn parse_constraints<T: DeserializeOwned>(constraints: &Value) -> Result<T, BrokerError> {
    serde_json::from_value(constraints.clone())
        .map_err(|error| BrokerError::InvalidConstraints(error.to_string()))
}

fn effective_max(configured: Option<f64>, default: usize) -> usize {
    match configured {
        Some(m) if m > 0.0 => m as usize,
        _ => default,
    }
}

/// Prefix match where the character immediately after the root, if any, must
/// be a path separator — `/work` admits `/work` and `/work/foo` but not
/// `/workspace`.
fn path_under(path: &str, root: &str) -> bool {
    if root.is_empty() {
        return false;
    }
    match path.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\'),
        None => false,
    }
}

fn path_under_roots(path: &str, roots: &[String]) -> bool {
    roots.iter().any(|root| path_under(path, root))
}

/// Scheme-relative host extraction: cut at `//`, stop at the first `/`,
/// strip the port, lowercase.
fn host_of(url: &str) -> String {
    let rest = match url.find("//") {
        Some(index) => &url[index + 2..],
        None => url,
    };
    let host = rest.split('/').next().unwrap_or("");
    host.split(':').next().unwrap_or("").to_ascii_lowercase()
}

fn domain_allowed(url: &str, domains: &[String]) -> bool {
    let host = host_of(url);
    domains.iter().any(|domain| {
        let domain = domain.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}
