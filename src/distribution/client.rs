//! OCI Distribution v2 client.
//!
//! Speaks the registry HTTP API directly: version probe, bearer/basic
//! authentication, manifest GET/HEAD/PUT and blob transfer with chunked
//! uploads. Tokens are cached per registry, repository and operation.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{
    manifest::MANIFEST_ACCEPT_TYPES, BlobProgress, Distribution, DistributionError, FetchedManifest,
    RepoAddress,
};
use crate::keychain::RegistryAuth;
use crate::reference::ImageReference;

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Upload chunk size for blob PATCH requests.
const UPLOAD_CHUNK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Operation {
    Pull,
    Push,
}

impl Operation {
    fn scope_actions(self) -> &'static str {
        match self {
            Operation::Pull => "pull",
            Operation::Push => "pull,push",
        }
    }
}

/// OCI error envelope returned on 4xx responses.
#[derive(Debug, Deserialize)]
struct OciEnvelope {
    #[serde(default)]
    errors: Vec<OciError>,
}

#[derive(Debug, Deserialize)]
struct OciError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

pub struct RegistryClient {
    http: reqwest::Client,
    insecure: bool,
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    /// `insecure` switches to the HTTP scheme and disables certificate
    /// verification; it applies to every call made through this client.
    pub fn new(insecure: bool) -> Result<Self, DistributionError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self {
            http,
            insecure,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }

    /// Docker Hub names resolve to the actual API host.
    fn api_host(registry: &str) -> &str {
        match registry {
            "docker.io" | "index.docker.io" => "registry-1.docker.io",
            other => other,
        }
    }

    fn base_url(&self, registry: &str) -> String {
        format!("{}://{}", self.scheme(), Self::api_host(registry))
    }

    fn manifest_url(&self, image: &ImageReference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(image.registry()),
            image.repository(),
            image.identifier()
        )
    }

    fn blob_url(&self, repo: &RepoAddress, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(&repo.registry),
            repo.repository,
            digest
        )
    }

    fn accept_header() -> HeaderValue {
        HeaderValue::from_str(&MANIFEST_ACCEPT_TYPES.join(",")).expect("static header value")
    }

    /// Resolves the Authorization header for an operation, performing the
    /// token handshake when the registry demands one.
    async fn authorization(
        &self,
        registry: &str,
        repository: &str,
        op: Operation,
        auth: &RegistryAuth,
    ) -> Result<Option<String>, DistributionError> {
        if let RegistryAuth::Bearer { token } = auth {
            return Ok(Some(format!("Bearer {token}")));
        }

        let cache_key = format!("{registry}|{repository}|{}", op.scope_actions());
        if let Some(cached) = self.tokens.lock().expect("token cache poisoned").get(&cache_key) {
            return Ok(Some(cached.clone()));
        }

        let probe_url = format!("{}/v2/", self.base_url(registry));
        let probe = self.http.get(&probe_url).send().await?;
        let challenge = probe
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let header = match challenge {
            Some(challenge) if challenge.trim_start().to_lowercase().starts_with("bearer") => {
                let fields = parse_challenge_fields(&challenge);
                let realm = fields.get("realm").cloned().ok_or_else(|| {
                    DistributionError::Protocol(format!(
                        "bearer challenge from {registry} has no realm"
                    ))
                })?;
                let scope = format!("repository:{repository}:{}", op.scope_actions());
                let mut request = self.http.get(&realm).query(&[("scope", scope.as_str())]);
                if let Some(service) = fields.get("service") {
                    request = request.query(&[("service", service.as_str())]);
                }
                if let RegistryAuth::Basic { username, password } = auth {
                    request = request.basic_auth(username, Some(password));
                }
                debug!(realm, registry, "requesting registry token");
                let response = request.send().await?;
                if !response.status().is_success() {
                    return Err(DistributionError::TokenExchange {
                        realm,
                        reason: format!("status {}", response.status().as_u16()),
                    });
                }
                let token: TokenResponse =
                    response.json().await.map_err(|err| DistributionError::TokenExchange {
                        realm: realm.clone(),
                        reason: err.to_string(),
                    })?;
                Some(format!("Bearer {}", token.token))
            }
            _ => basic_header(auth),
        };

        if let Some(header) = &header {
            self.tokens
                .lock()
                .expect("token cache poisoned")
                .insert(cache_key, header.clone());
        }
        Ok(header)
    }

    fn auth_headers(&self, authorization: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, Self::accept_header());
        if let Some(value) = authorization {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Maps an unexpected response to a status error carrying the OCI error
    /// envelope diagnostics when the body has them.
    async fn status_error(url: &str, response: Response) -> DistributionError {
        let status = response.status().as_u16();
        let details = match response.json::<OciEnvelope>().await {
            Ok(envelope) => envelope
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect(),
            Err(_) => Vec::new(),
        };
        DistributionError::Status {
            status,
            url: url.to_owned(),
            details,
        }
    }

    /// Resolves an upload Location header, which may be relative.
    fn resolve_location(&self, registry: &str, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_owned()
        } else {
            format!("{}{}", self.base_url(registry), location)
        }
    }
}

fn basic_header(auth: &RegistryAuth) -> Option<String> {
    match auth {
        RegistryAuth::Basic { username, password } => {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            Some(format!("Basic {encoded}"))
        }
        RegistryAuth::Bearer { token } => Some(format!("Bearer {token}")),
        RegistryAuth::Anonymous => None,
    }
}

/// Parses the comma-separated `key="value"` fields of an auth challenge.
fn parse_challenge_fields(challenge: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let body = match challenge.trim_start().split_once(' ') {
        Some((_, body)) => body,
        None => return fields,
    };
    for part in body.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            fields.insert(
                key.trim().to_lowercase(),
                value.trim().trim_matches('"').to_owned(),
            );
        }
    }
    fields
}

fn digest_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[async_trait]
impl Distribution for RegistryClient {
    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<FetchedManifest, DistributionError> {
        let authorization = self
            .authorization(image.registry(), image.repository(), Operation::Pull, auth)
            .await?;
        let url = self.manifest_url(image);
        debug!(%url, "fetching manifest");
        let response = self
            .http
            .get(&url)
            .headers(self.auth_headers(authorization.as_deref()))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(Self::status_error(&url, response).await);
        }
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_owned());
        let digest = digest_header(&response);
        let payload = response.bytes().await?.to_vec();
        let digest = digest.unwrap_or_else(|| super::manifest::digest_of(&payload));
        Ok(FetchedManifest {
            digest,
            media_type,
            payload,
        })
    }

    async fn head_manifest(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<Option<String>, DistributionError> {
        let authorization = self
            .authorization(image.registry(), image.repository(), Operation::Pull, auth)
            .await?;
        let url = self.manifest_url(image);
        let response = self
            .http
            .head(&url)
            .headers(self.auth_headers(authorization.as_deref()))
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => digest_header(&response).map(Some).ok_or_else(|| {
                DistributionError::Protocol(format!("registry did not return a digest header for {url}"))
            }),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::status_error(&url, response).await),
        }
    }

    async fn put_manifest(
        &self,
        image: &ImageReference,
        media_type: &str,
        payload: &[u8],
        auth: &RegistryAuth,
    ) -> Result<(), DistributionError> {
        let authorization = self
            .authorization(image.registry(), image.repository(), Operation::Push, auth)
            .await?;
        let url = self.manifest_url(image);
        debug!(%url, media_type, "pushing manifest");
        let mut headers = self.auth_headers(authorization.as_deref());
        if let Ok(value) = HeaderValue::from_str(media_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        let response = self
            .http
            .put(&url)
            .headers(headers)
            .body(payload.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(&url, response).await);
        }
        Ok(())
    }

    async fn blob_exists(
        &self,
        repo: &RepoAddress,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<bool, DistributionError> {
        let authorization = self
            .authorization(&repo.registry, &repo.repository, Operation::Pull, auth)
            .await?;
        let url = self.blob_url(repo, digest);
        let response = self
            .http
            .head(&url)
            .headers(self.auth_headers(authorization.as_deref()))
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::status_error(&url, response).await),
        }
    }

    async fn fetch_blob(
        &self,
        repo: &RepoAddress,
        digest: &str,
        auth: &RegistryAuth,
    ) -> Result<Vec<u8>, DistributionError> {
        let authorization = self
            .authorization(&repo.registry, &repo.repository, Operation::Pull, auth)
            .await?;
        let url = self.blob_url(repo, digest);
        let response = self
            .http
            .get(&url)
            .headers(self.auth_headers(authorization.as_deref()))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(&url, response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn copy_blob(
        &self,
        src: &RepoAddress,
        src_auth: &RegistryAuth,
        dst: &RepoAddress,
        dst_auth: &RegistryAuth,
        digest: &str,
        progress: Option<&BlobProgress>,
    ) -> Result<u64, DistributionError> {
        let pull_authorization = self
            .authorization(&src.registry, &src.repository, Operation::Pull, src_auth)
            .await?;
        let push_authorization = self
            .authorization(&dst.registry, &dst.repository, Operation::Push, dst_auth)
            .await?;

        // Open the source stream first so a missing blob fails fast.
        let src_url = self.blob_url(src, digest);
        let source = self
            .http
            .get(&src_url)
            .headers(self.auth_headers(pull_authorization.as_deref()))
            .send()
            .await?;
        if !source.status().is_success() {
            return Err(Self::status_error(&src_url, source).await);
        }
        let mut stream = source.bytes_stream();

        // Start an upload session at the target.
        let start_url = format!(
            "{}/v2/{}/blobs/uploads/",
            self.base_url(&dst.registry),
            dst.repository
        );
        let started = self
            .http
            .post(&start_url)
            .headers(self.auth_headers(push_authorization.as_deref()))
            .send()
            .await?;
        if started.status() != StatusCode::ACCEPTED && !started.status().is_success() {
            return Err(Self::status_error(&start_url, started).await);
        }
        let mut location = started
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| self.resolve_location(&dst.registry, v))
            .ok_or_else(|| {
                DistributionError::Protocol(format!("upload start for {digest} returned no location"))
            })?;

        let mut offset: u64 = 0;
        let mut buffer: Vec<u8> = Vec::with_capacity(UPLOAD_CHUNK_SIZE);

        let flush_chunk = |location: &str,
                           buffer: Vec<u8>,
                           offset: u64|
         -> reqwest::RequestBuilder {
            let mut range = String::new();
            let _ = write!(range, "{}-{}", offset, offset + buffer.len() as u64 - 1);
            self.http
                .patch(location)
                .headers(self.auth_headers(push_authorization.as_deref()))
                .header(CONTENT_TYPE, "application/octet-stream")
                .header("Content-Range", range)
                .body(buffer)
        };

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            if buffer.len() < UPLOAD_CHUNK_SIZE {
                continue;
            }
            let body = std::mem::replace(&mut buffer, Vec::with_capacity(UPLOAD_CHUNK_SIZE));
            let sent = body.len() as u64;
            let response = flush_chunk(&location, body, offset).send().await?;
            if !response.status().is_success() {
                return Err(Self::status_error(&location, response).await);
            }
            if let Some(next) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            {
                location = self.resolve_location(&dst.registry, next);
            }
            offset += sent;
            if let Some(progress) = progress {
                progress.add(sent);
            }
        }

        // Commit the upload, sending any remaining bytes with the final PUT.
        let separator = if location.contains('?') { '&' } else { '?' };
        let commit_url = format!("{location}{separator}digest={digest}");
        let remaining = buffer.len() as u64;
        let response = self
            .http
            .put(&commit_url)
            .headers(self.auth_headers(push_authorization.as_deref()))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(buffer)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(&commit_url, response).await);
        }
        if remaining > 0 {
            if let Some(progress) = progress {
                progress.add(remaining);
            }
        }

        Ok(offset + remaining)
    }
}
