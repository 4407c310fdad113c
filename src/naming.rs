// src/naming.rs

use reqwest::{header, Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on `name (n).ext` attempts before giving up.
const MAX_DISAMBIGUATION_ATTEMPTS: u32 = 10_000;

const FALLBACK_STEM: &str = "download";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid location '{0}'")]
    InvalidLocation(String),
    #[error("no free file name for '{0}'")]
    Exhausted(String),
    #[error("'{}' is already in use by another transfer", .0.display())]
    InUse(PathBuf),
    #[error("cannot inspect download directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps a declared content type onto a file extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentTypeRule {
    /// Matched as a substring of the Content-Type header value.
    pub contains: String,
    pub extension: String,
}

impl ContentTypeRule {
    fn new(contains: &str, extension: &str) -> Self {
        Self { contains: contains.to_string(), extension: extension.to_string() }
    }
}

/// The allow-list of extensions a name may already carry, and how to pick
/// one when it carries none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MediaTypes {
    pub extensions: Vec<String>,
    pub rules: Vec<ContentTypeRule>,
    /// Used when the probe fails or reports an unlisted type.
    pub fallback_extension: String,
}

impl Default for MediaTypes {
    fn default() -> Self {
        Self {
            extensions: ["jpg", "jpeg", "png", "gif", "bmp", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rules: vec![
                ContentTypeRule::new("jpeg", "jpg"),
                ContentTypeRule::new("png", "png"),
                ContentTypeRule::new("gif", "gif"),
                ContentTypeRule::new("bmp", "bmp"),
                ContentTypeRule::new("webp", "webp"),
            ],
            fallback_extension: "jpg".to_string(),
        }
    }
}

impl MediaTypes {
    pub fn has_known_extension(&self, name: &str) -> bool {
        let Some((stem, ext)) = name.rsplit_once('.') else {
            return false;
        };
        !stem.is_empty() && self.extensions.iter().any(|known| known.eq_ignore_ascii_case(ext))
    }

    pub fn extension_for(&self, content_type: Option<&str>) -> &str {
        let Some(content_type) = content_type else {
            return &self.fallback_extension;
        };
        let content_type = content_type.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| content_type.contains(&rule.contains.to_ascii_lowercase()))
            .map(|rule| rule.extension.as_str())
            .unwrap_or(&self.fallback_extension)
    }
}

/// Holds a destination path for the lifetime of a transfer so that no other
/// transfer in this process is handed the same name. Released on drop.
#[derive(Debug)]
pub struct NameReservation {
    path: PathBuf,
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
}

impl NameReservation {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NameReservation {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.remove(&self.path);
    }
}

/// Derives unique local file names from remote locations.
#[derive(Debug, Clone)]
pub struct NameResolver {
    client: Client,
    dir: PathBuf,
    media: Arc<MediaTypes>,
    probe_timeout: Duration,
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
}

impl NameResolver {
    pub fn new(client: Client, dir: PathBuf, media: MediaTypes, probe_timeout: Duration) -> Self {
        Self {
            client,
            dir,
            media: Arc::new(media),
            probe_timeout,
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Picks a name under the download directory that neither exists on disk
    /// nor is held by another live transfer, and reserves it.
    ///
    /// Another process creating the same file between the check and the
    /// first write is not guarded against.
    pub async fn resolve(&self, location: &str) -> Result<NameReservation, ResolveError> {
        let url = Url::parse(location.trim())
            .map_err(|_| ResolveError::InvalidLocation(location.to_string()))?;

        let mut name = candidate_name(&url);
        if !self.media.has_known_extension(&name) {
            let content_type = self.probe_content_type(&url).await;
            let ext = self.media.extension_for(content_type.as_deref());
            name = format!("{name}.{ext}");
        }

        let mut attempt = 0;
        loop {
            let file_name = if attempt == 0 { name.clone() } else { disambiguate(&name, attempt) };
            let path = self.dir.join(&file_name);
            if !tokio::fs::try_exists(&path).await? {
                if let Some(held) = self.claim(&path) {
                    tracing::debug!(location, path = %path.display(), "resolved local name");
                    return Ok(held);
                }
            }
            attempt += 1;
            if attempt > MAX_DISAMBIGUATION_ATTEMPTS {
                return Err(ResolveError::Exhausted(name));
            }
        }
    }

    /// Takes `path` only if no live transfer in this process holds it. The
    /// disk is not consulted: a transfer continuing onto its own partial file
    /// claims the name this way.
    pub fn claim(&self, path: &Path) -> Option<NameReservation> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        if !reserved.insert(path.to_path_buf()) {
            return None;
        }
        Some(NameReservation { path: path.to_path_buf(), reserved: self.reserved.clone() })
    }

    /// Declared Content-Type of the remote, or `None` if it cannot be had.
    async fn probe_content_type(&self, url: &Url) -> Option<String> {
        let resp = match self.client.head(url.clone()).timeout(self.probe_timeout).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::debug!(%url, status = %resp.status(), "content type probe rejected");
                return None;
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, "content type probe failed");
                return None;
            }
        };
        resp.headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Last non-empty path segment, percent-decoded and stripped of anything
/// that could escape the download directory.
fn candidate_name(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("");
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    let cleaned: String = decoded
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        cleaned.to_string()
    }
}

/// `name.ext` -> `name (n).ext`; `name` -> `name (n)`.
fn disambiguate(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{name} ({n})"),
    }
}
