//! Configuration loaded from `$XDG_CONFIG_HOME/chatstream/config.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! The client session id is either configured or persisted under
//! `$XDG_STATE_HOME/chatstream`.

use cs_backend::http::build_http_client;
use cs_backend::{
    DecodeMode, EventSourceTransport, HttpTransport, RequestMethod, Transport, TransportError,
    DEFAULT_SENTINEL,
};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("incompatible backend settings: {0}")]
    Incompatible(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Chunked HTTP body, read as it arrives.
    #[default]
    Http,
    /// Server-sent events delivered through an event source.
    EventSource,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Chat endpoint.
    pub url: String,
    pub transport: TransportKind,
    /// Request shape for the HTTP transport. The event source always uses
    /// `get-query`.
    pub method: RequestMethod,
    /// Response framing. Defaults to `lines` over HTTP and `messages` over an
    /// event source.
    pub decode: Option<DecodeMode>,
    /// End-of-stream marker for framed responses.
    pub sentinel: String,
    pub connect_timeout_secs: u64,
    /// Bound on the whole exchange, body included. Unset means no limit.
    pub timeout_secs: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/chat/basic".to_string(),
            transport: TransportKind::Http,
            method: RequestMethod::PostJson,
            decode: None,
            sentinel: DEFAULT_SENTINEL.to_string(),
            connect_timeout_secs: 10,
            timeout_secs: None,
        }
    }
}

impl BackendConfig {
    /// The decode mode for this transport. Event-source payloads arrive
    /// already split, so only `messages` fits there, and only there.
    pub fn decode_mode(&self) -> Result<DecodeMode, ConfigError> {
        match (self.transport, self.decode) {
            (TransportKind::EventSource, None | Some(DecodeMode::Messages)) => {
                Ok(DecodeMode::Messages)
            }
            (TransportKind::EventSource, Some(mode)) => Err(ConfigError::Incompatible(format!(
                "event-source transport cannot decode {mode:?} responses"
            ))),
            (TransportKind::Http, Some(DecodeMode::Messages)) => Err(ConfigError::Incompatible(
                "messages decoding requires the event-source transport".to_string(),
            )),
            (TransportKind::Http, mode) => Ok(mode.unwrap_or_default()),
        }
    }

    pub fn build_transport(&self) -> Result<Box<dyn Transport>, ConfigError> {
        self.decode_mode()?;

        let http = build_http_client(
            Duration::from_secs(self.connect_timeout_secs),
            self.timeout_secs.map(Duration::from_secs),
        )?;
        debug!(url = %self.url, transport = ?self.transport, "backend configured");

        Ok(match self.transport {
            TransportKind::Http => Box::new(HttpTransport::new(http, &self.url, self.method)),
            TransportKind::EventSource => Box::new(EventSourceTransport::new(http, &self.url)),
        })
    }
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Client session id sent with every request.
    pub id: Option<String>,
    /// Generate an id once and reuse it across runs.
    pub persist: bool,
}

impl SessionConfig {
    /// The configured id, else the persisted one when `persist` is set.
    pub fn resolve_id(&self) -> Option<String> {
        if let Some(ref id) = self.id {
            return Some(id.clone());
        }
        if !self.persist {
            return None;
        }
        Some(load_or_create_id(&state_dir().join("session_id")))
    }
}

/// Read the id stored at `path`, or generate and store a new one. A write
/// failure only costs reuse on the next run.
fn load_or_create_id(path: &Path) -> String {
    if let Ok(contents) = std::fs::read_to_string(path) {
        let id = contents.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }

    let id = generate_session_id();
    let written = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| std::fs::write(path, &id));
    if let Err(e) = written {
        warn!(path = %path.display(), error = %e, "could not persist session id");
    }
    id
}

fn generate_session_id() -> String {
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("s{:x}", pid ^ (ts as u32))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_or_default() -> Self {
        let path = config_path();
        if !path.exists() {
            return Config::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            warn!("{e}; using defaults");
            Config::default()
        })
    }
}

pub fn config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
        .join("chatstream")
        .join("config.toml")
}

fn state_dir() -> PathBuf {
    xdg_dir("XDG_STATE_HOME", ".local/state").join("chatstream")
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(fallback)
    })
}
