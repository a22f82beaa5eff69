//! Remote vault backend for note servers exposing the Obsidian Local REST
//! API shape.
//!
//! The server's API surface is not fully standardized, so each operation
//! tries a short list of known request shapes and takes the first success.
//! Intermediate failures are logged at debug level; only the last one
//! surfaces, as `BackendUnavailable`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use cope_rag_core::{Error, Result};

use super::rules::{normalize_rel, VaultRules};
use super::{BackendKind, NoteFile, NoteHit, VaultAdapter, VaultHealth};
use crate::config::{CollisionPolicy, VaultConfig};

/// Directory listings descend at most this deep.
const MAX_LIST_DEPTH: usize = 8;
const NOTE_JSON: &str = "application/vnd.olrapi.note+json";

pub struct RemoteVault {
    base: Url,
    api_key: String,
    client: reqwest::Client,
    rules: VaultRules,
    max_notes: usize,
    max_note_bytes: u64,
    collision_policy: CollisionPolicy,
}

/// One way of asking the server for something.
struct Shape {
    method: Method,
    url: Url,
    accept: Option<&'static str>,
    body: Option<String>,
}

impl Shape {
    fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            accept: None,
            body: None,
        }
    }

    fn accept(mut self, accept: &'static str) -> Self {
        self.accept = Some(accept);
        self
    }

    fn body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }
}

#[derive(Deserialize)]
struct Listing {
    #[serde(default)]
    files: Vec<String>,
}

/// Reject absolute paths and `..` before the request leaves the process.
fn check_remote_path(rules: &VaultRules, path: &str) -> Result<String> {
    let raw = path.trim().replace('\\', "/");
    if raw.is_empty() {
        return Err(Error::path_rejected(path, "empty path"));
    }
    if raw.starts_with('/') || raw.contains(':') {
        return Err(Error::path_rejected(path, "absolute paths are not allowed"));
    }
    if raw.split('/').any(|seg| seg == "..") {
        return Err(Error::path_rejected(path, "outside the vault root"));
    }
    let rel = normalize_rel(&raw);
    rules.check(&rel)?;
    Ok(rel)
}

fn with_md_extension(path: &str) -> String {
    if path.to_lowercase().ends_with(".md") {
        path.to_string()
    } else {
        format!("{}.md", path)
    }
}

fn millis_to_utc(value: &Value) -> Option<DateTime<Utc>> {
    value.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn title_from_path(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.strip_suffix(".md").unwrap_or(file).to_string()
}

/// Map one search result object, whatever its field names.
fn hit_from_json(item: &Value) -> Option<NoteHit> {
    let path = ["filename", "path", "file"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str))?
        .to_string();
    let snippet = item
        .get("matches")
        .and_then(Value::as_array)
        .and_then(|m| m.first())
        .and_then(|m| m.get("context"))
        .and_then(Value::as_str)
        .or_else(|| ["snippet", "excerpt"].iter().find_map(|k| item.get(*k).and_then(Value::as_str)))
        .unwrap_or("");
    let title = item
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| title_from_path(&path));
    Some(NoteHit {
        path,
        title,
        snippet: snippet.split_whitespace().collect::<Vec<_>>().join(" "),
    })
}

impl RemoteVault {
    pub fn new(config: &VaultConfig) -> anyhow::Result<Self> {
        let raw_url = config
            .remote_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::ConfigInvalid("vault.remote_url is required for the remote vault".into()))?;
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::ConfigInvalid("vault.api_key is required for the remote vault".into()))?;
        let base = Url::parse(raw_url.trim().trim_end_matches('/'))
            .map_err(|e| Error::ConfigInvalid(format!("vault.remote_url is not a URL: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base,
            api_key,
            client,
            rules: VaultRules::from_config(config)?,
            max_notes: config.max_notes_to_index,
            max_note_bytes: config.max_note_bytes,
            collision_policy: config.collision_policy,
        })
    }

    /// `base` + path segments (each percent-encoded) + optional trailing slash.
    fn url(&self, segments: &[&str], trailing_slash: bool) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut parts) = url.path_segments_mut() {
            parts.pop_if_empty();
            for seg in segments {
                for piece in seg.split('/').filter(|p| !p.is_empty()) {
                    parts.push(piece);
                }
            }
            if trailing_slash {
                parts.push("");
            }
        }
        url
    }

    fn vault_url(&self, rel: &str) -> Url {
        self.url(&["vault", rel], false)
    }

    /// Send each shape in turn; return the first successful response.
    async fn try_shapes(&self, what: &str, shapes: Vec<Shape>) -> Result<reqwest::Response> {
        let mut last_err = format!("{}: no request shapes", what);
        for shape in shapes {
            let mut request = self
                .client
                .request(shape.method.clone(), shape.url.clone())
                .bearer_auth(&self.api_key);
            if let Some(accept) = shape.accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            if let Some(body) = shape.body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, "text/markdown")
                    .body(body);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    last_err = format!("{} {} {} -> {}", what, shape.method, shape.url, response.status());
                }
                Err(e) => {
                    last_err = format!("{} {} {}: {}", what, shape.method, shape.url, e);
                }
            }
            debug!(error = %last_err, "remote vault shape failed");
        }
        Err(Error::BackendUnavailable(last_err))
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let shapes = if dir.is_empty() {
            vec![
                Shape::new(Method::GET, self.url(&["vault"], true)),
                Shape::new(Method::GET, self.url(&["vault"], false)),
            ]
        } else {
            vec![Shape::new(Method::GET, self.url(&["vault", dir], true))]
        };
        let response = self.try_shapes("list", shapes).await?;
        let listing: Listing = response
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("invalid listing: {}", e)))?;
        Ok(listing.files)
    }

    async fn exists(&self, rel: &str) -> bool {
        self.client
            .get(self.vault_url(rel))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn write(&self, rel: &str, content: &str) -> Result<()> {
        let shapes = vec![
            Shape::new(Method::PUT, self.vault_url(rel)).body(content),
            Shape::new(Method::POST, self.vault_url(rel)).body(content),
        ];
        self.try_shapes("create", shapes).await?;
        Ok(())
    }
}

#[async_trait]
impl VaultAdapter for RemoteVault {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn list_notes(&self) -> Result<Vec<String>> {
        let mut notes = Vec::new();
        let mut pending: Vec<(String, usize)> = vec![(String::new(), 0)];
        while let Some((dir, depth)) = pending.pop() {
            for entry in self.list_dir(&dir).await? {
                let full = if dir.is_empty() {
                    entry.clone()
                } else {
                    format!("{}/{}", dir.trim_end_matches('/'), entry)
                };
                if full.ends_with('/') {
                    let sub = full.trim_end_matches('/').to_string();
                    if depth < MAX_LIST_DEPTH && !self.rules.is_excluded(&sub) {
                        pending.push((sub, depth + 1));
                    }
                    continue;
                }
                if full.to_lowercase().ends_with(".md") && self.rules.allows(&full) {
                    notes.push(normalize_rel(&full));
                }
            }
        }
        notes.sort();
        notes.dedup();
        notes.truncate(self.max_notes);
        Ok(notes)
    }

    async fn read_note(&self, path: &str) -> Result<NoteFile> {
        let rel = check_remote_path(&self.rules, path)?;
        let shapes = vec![
            Shape::new(Method::GET, self.vault_url(&rel)).accept(NOTE_JSON),
            Shape::new(Method::GET, self.vault_url(&rel)).accept("text/markdown"),
        ];
        let response = self.try_shapes("read", shapes).await?;
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let text = response
            .text()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("read {}: {}", rel, e)))?;

        let (content, modified_at) = match serde_json::from_str::<Value>(&text) {
            Ok(json) if is_json && json.get("content").is_some() => (
                json.get("content").and_then(Value::as_str).unwrap_or("").to_string(),
                json.get("stat").and_then(|s| s.get("mtime")).and_then(millis_to_utc),
            ),
            _ => (text, None),
        };

        if content.len() as u64 > self.max_note_bytes {
            return Err(Error::ExtractionFailed(format!(
                "{} is {} bytes, above the {} byte limit",
                rel,
                content.len(),
                self.max_note_bytes
            )));
        }
        Ok(NoteFile {
            path: rel,
            content,
            modified_at,
        })
    }

    async fn create_note(&self, path: &str, content: &str) -> Result<String> {
        let rel = check_remote_path(&self.rules, &with_md_extension(path))?;
        let mut target = rel.clone();
        if self.exists(&rel).await {
            match self.collision_policy {
                CollisionPolicy::Append => return self.append_note(&rel, content).await,
                CollisionPolicy::Rename => {
                    let stem = rel.strip_suffix(".md").unwrap_or(&rel).to_string();
                    let mut n = 1;
                    loop {
                        target = if n == 1 {
                            format!("{}-new.md", stem)
                        } else {
                            format!("{}-new-{}.md", stem, n)
                        };
                        if n >= 50 || !self.exists(&target).await {
                            break;
                        }
                        n += 1;
                    }
                }
            }
        }
        self.write(&target, content).await?;
        Ok(target)
    }

    async fn append_note(&self, path: &str, content: &str) -> Result<String> {
        let rel = check_remote_path(&self.rules, &with_md_extension(path))?;
        let body = format!("\n\n{}", content);
        let shapes = vec![
            Shape::new(Method::POST, self.vault_url(&rel)).body(&body),
            Shape::new(Method::POST, self.url(&["vault", &rel], true)).body(&body),
        ];
        self.try_shapes("append", shapes).await?;
        Ok(rel)
    }

    async fn search_notes(&self, query: &str, limit: usize) -> Result<Vec<NoteHit>> {
        let mut simple = self.url(&["search", "simple"], true);
        simple
            .query_pairs_mut()
            .append_pair("query", query)
            .append_pair("contextLength", "100");
        let mut no_slash = self.url(&["search", "simple"], false);
        no_slash.query_pairs_mut().append_pair("query", query);
        let mut plain = self.url(&["search"], false);
        plain.query_pairs_mut().append_pair("query", query);

        let shapes = vec![
            Shape::new(Method::POST, simple),
            Shape::new(Method::POST, no_slash),
            Shape::new(Method::GET, plain),
        ];
        let response = self.try_shapes("search", shapes).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("invalid search response: {}", e)))?;
        let items = json
            .as_array()
            .cloned()
            .or_else(|| json.get("results").and_then(Value::as_array).cloned())
            .unwrap_or_default();

        Ok(items
            .iter()
            .filter_map(hit_from_json)
            .filter(|h| self.rules.allows(&h.path))
            .take(limit)
            .collect())
    }

    async fn health(&self) -> VaultHealth {
        let shapes = vec![Shape::new(Method::GET, self.url(&[], true))];
        match self.try_shapes("health", shapes).await {
            Ok(_) => VaultHealth::ok(format!("remote vault at {}", self.base)),
            Err(e) => VaultHealth::down(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Routes = HashMap<String, (u16, &'static str, String)>;

    /// Minimal HTTP/1.1 responder keyed by `"METHOD /path?query"`.
    async fn serve(routes: Routes) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).to_string();
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let content_length = text[..head_end]
                            .lines()
                            .find_map(|l| {
                                let lower = l.to_lowercase();
                                lower
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        if buf.len() >= head_end + 4 + content_length {
                            break;
                        }
                    }
                }
                let text = String::from_utf8_lossy(&buf).to_string();
                let request_line = text.lines().next().unwrap_or("").to_string();
                let mut parts = request_line.split_whitespace();
                let key = format!(
                    "{} {}",
                    parts.next().unwrap_or(""),
                    parts.next().unwrap_or("")
                );
                log.lock().unwrap().push(key.clone());
                let (status, content_type, body) = routes
                    .get(&key)
                    .cloned()
                    .unwrap_or((404, "text/plain", "not found".to_string()));
                let response = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    content_type,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), seen)
    }

    fn remote(url: &str) -> RemoteVault {
        RemoteVault::new(&VaultConfig {
            remote_url: Some(url.to_string()),
            api_key: Some("secret".to_string()),
            ..VaultConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_server_is_down_and_unavailable() {
        let v = remote("http://127.0.0.1:1");
        assert!(!v.health().await.ok);
        assert!(matches!(v.list_notes().await, Err(Error::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_paths_are_checked_before_any_request() {
        let v = remote("http://127.0.0.1:1");
        assert!(v.read_note("../secret.md").await.unwrap_err().is_path_rejected());
        assert!(v.read_note("/etc/passwd").await.unwrap_err().is_path_rejected());
        assert!(v.append_note(".obsidian/x.md", "x").await.unwrap_err().is_path_rejected());
    }

    #[tokio::test]
    async fn test_list_recurses_and_filters() {
        let mut routes = Routes::new();
        routes.insert(
            "GET /vault/".into(),
            (200, "application/json", r#"{"files":["a.md","Cours/","templates/","img.png"]}"#.into()),
        );
        routes.insert(
            "GET /vault/Cours/".into(),
            (200, "application/json", r#"{"files":["volley.md"]}"#.into()),
        );
        let (url, _) = serve(routes).await;
        let v = remote(&url);
        assert_eq!(v.list_notes().await.unwrap(), vec!["Cours/volley.md", "a.md"]);
    }

    #[tokio::test]
    async fn test_read_falls_back_between_shapes() {
        let mut routes = Routes::new();
        routes.insert(
            "GET /vault/Cours/volley.md".into(),
            (
                200,
                "application/vnd.olrapi.note+json",
                r##"{"content":"# Volley","stat":{"mtime":1700000000000}}"##.into(),
            ),
        );
        routes.insert(
            "POST /search/simple/?query=volley&contextLength=100".into(),
            (500, "text/plain", "boom".into()),
        );
        routes.insert(
            "POST /search/simple?query=volley".into(),
            (
                200,
                "application/json",
                r#"[{"filename":"Cours/volley.md","matches":[{"context":"le  volley"}]}]"#.into(),
            ),
        );
        let (url, seen) = serve(routes).await;
        let v = remote(&url);

        let note = v.read_note("Cours/volley.md").await.unwrap();
        assert_eq!(note.content, "# Volley");
        assert_eq!(note.modified_at.unwrap().timestamp(), 1_700_000_000);

        let hits = v.search_notes("volley", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "volley");
        assert_eq!(hits[0].snippet, "le volley");
        assert!(seen.lock().unwrap().iter().any(|k| k.starts_with("POST /search/simple/")));
    }

    #[test]
    fn test_hit_from_json_variants() {
        let hit = hit_from_json(&serde_json::json!({"path": "x/y.md", "snippet": "s"})).unwrap();
        assert_eq!(hit.title, "y");
        assert_eq!(hit.snippet, "s");
        assert!(hit_from_json(&serde_json::json!({"score": 1})).is_none());
    }
}
