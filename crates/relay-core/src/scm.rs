//! Source-control API client: the sync engine's view of the external store
//! backing synced records (a GitHub-Contents-API-shaped interface). Every
//! call is scoped by an explicit `(owner, repo, path, ref/branch)`, since a
//! single process may sync records across many repositories and branches.

use crate::error::{Error, Result};
use reqwest::Client;
use sha2::{Digest, Sha256};

/// A single remote file fetched from the source-control API.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub content: String,
    pub hash: String,
}

/// The source-control API contract from the external-interfaces section:
/// read and write a single path's content under a precondition on its
/// current hash, so concurrent writers detect each other instead of
/// silently clobbering.
#[async_trait::async_trait]
pub trait SourceControlApi: Send + Sync {
    /// `GetContent(owner, repo, path, ref) -> {content, hash}` or not-found.
    async fn get_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Option<RemoteFile>>;

    /// `PutContent(owner, repo, path, branch, bytes, message,
    /// expectedParentHash?) -> {newHash}` or a hash-mismatch error (409).
    /// `expected_parent_hash` is omitted on a record's first write.
    async fn put_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
        expected_parent_hash: Option<&str>,
    ) -> Result<String>;
}

/// Content-addressed hash, independent of the remote API's own hash scheme.
/// Used by tests and fakes to simulate a remote's content hash.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Split an `owner/repo` style repository identifier.
fn split_repository(repository: &str) -> Result<(&str, &str)> {
    repository
        .split_once('/')
        .ok_or_else(|| Error::ScmApi(format!("malformed repository identifier: {repository}")))
}

/// GitHub-Contents-API-compatible client.
pub struct GitHubScmClient {
    client: Client,
    api_base: String,
    token: String,
}

impl GitHubScmClient {
    pub fn new(api_base: String, token: String) -> Self {
        Self {
            client: Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_base,
            token,
        }
    }

    fn contents_url(&self, owner: &str, repo: &str, path: &str) -> String {
        format!("{}/repos/{}/{}/contents/{}", self.api_base, owner, repo, path)
    }

    /// Convenience for callers that carry repositories as `"owner/repo"`
    /// strings (the shape `Record.repository` uses).
    pub async fn get_content_for(&self, repository: &str, path: &str, reference: &str) -> Result<Option<RemoteFile>> {
        let (owner, repo) = split_repository(repository)?;
        self.get_content(owner, repo, path, reference).await
    }

    pub async fn put_content_for(
        &self,
        repository: &str,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
        expected_parent_hash: Option<&str>,
    ) -> Result<String> {
        let (owner, repo) = split_repository(repository)?;
        self.put_content(owner, repo, path, branch, content, message, expected_parent_hash)
            .await
    }
}

#[derive(serde::Deserialize)]
struct ContentsResponse {
    content: String,
    sha: String,
    encoding: String,
}

#[derive(serde::Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(serde::Deserialize)]
struct PutContentsResponse {
    content: PutContentsContent,
}

#[derive(serde::Deserialize)]
struct PutContentsContent {
    sha: String,
}

#[async_trait::async_trait]
impl SourceControlApi for GitHubScmClient {
    async fn get_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Option<RemoteFile>> {
        let response = self
            .client
            .get(self.contents_url(owner, repo, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "relay-sync-engine")
            .query(&[("ref", reference)])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::ScmApi(format!(
                "GET {path} failed with status {}",
                response.status()
            )));
        }

        let body: ContentsResponse = response.json().await?;
        if body.encoding != "base64" {
            return Err(Error::ScmApi(format!("unsupported encoding: {}", body.encoding)));
        }

        let decoded = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            body.content.replace('\n', ""),
        )
        .map_err(|e| Error::ScmApi(format!("invalid base64 content: {e}")))?;
        let content = String::from_utf8(decoded)
            .map_err(|e| Error::ScmApi(format!("non-utf8 content: {e}")))?;

        Ok(Some(RemoteFile {
            content,
            hash: body.sha,
        }))
    }

    async fn put_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
        content: &str,
        message: &str,
        expected_parent_hash: Option<&str>,
    ) -> Result<String> {
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, content);
        let request = PutContentsRequest {
            message,
            content: encoded,
            branch,
            sha: expected_parent_hash,
        };

        let response = self
            .client
            .put(self.contents_url(owner, repo, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "relay-sync-engine")
            .json(&request)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            // The remote's current sha did not match what we supplied;
            // surface as a hash mismatch rather than a generic API error so
            // the sync-out path can route into conflict handling.
            let observed = self
                .get_content(owner, repo, path, branch)
                .await
                .ok()
                .flatten()
                .map(|f| f.hash)
                .unwrap_or_default();
            return Err(Error::ScmHashMismatch {
                expected: expected_parent_hash.unwrap_or("").to_string(),
                observed,
            });
        }
        if !response.status().is_success() {
            return Err(Error::ScmApi(format!(
                "PUT {path} failed with status {}",
                response.status()
            )));
        }

        let body: PutContentsResponse = response.json().await?;
        Ok(body.content.sha)
    }
}
