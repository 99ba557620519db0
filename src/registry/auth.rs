//! Registry authentication
//!
//! Two layers: a [`Keychain`] that resolves `(username, password)` pairs
//! for a registry host from the Docker config file and credential
//! helpers (chained: Docker config, then GCR, ECR, ACR, GHCR), and the
//! bearer-token flow that turns those credentials into a scoped token
//! via the registry's `WWW-Authenticate` challenge.
//!
//! Credential helpers are opaque `(username, password)` producers; they
//! are invoked as `docker-credential-<name> get` with the registry host
//! on stdin.

use crate::error::{ImageError, Result};
use crate::logging::Logger;
use crate::transport::send_with_retry;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Resolves credentials for registry hosts. Construction reads the
/// Docker config once; helper binaries run on demand.
#[derive(Debug, Default)]
pub struct Keychain {
    auths: HashMap<String, Credentials>,
    cred_helpers: HashMap<String, String>,
    creds_store: Option<String>,
    /// `IMG_CREDENTIAL_HELPER`: one helper for every host
    global_helper: Option<String>,
}

impl Keychain {
    /// Build the keychain from `REGISTRY_AUTH_FILE`, `DOCKER_CONFIG`, or
    /// `~/.docker/config.json`, plus `IMG_CREDENTIAL_HELPER`.
    pub fn from_environment() -> Self {
        let mut keychain = Keychain {
            global_helper: std::env::var("IMG_CREDENTIAL_HELPER").ok(),
            ..Keychain::default()
        };
        if let Some(path) = docker_config_path() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Ok(config) = serde_json::from_str::<DockerConfigFile>(&contents) {
                    keychain.load_config(config);
                }
            }
        }
        keychain
    }

    fn load_config(&mut self, config: DockerConfigFile) {
        for (host, entry) in config.auths {
            let credentials = match (&entry.username, &entry.password, &entry.auth) {
                (Some(username), Some(password), _) => Some(Credentials {
                    username: username.clone(),
                    password: password.clone(),
                }),
                (_, _, Some(auth)) => decode_basic_auth(auth),
                _ => None,
            };
            if let Some(credentials) = credentials {
                self.auths.insert(normalize_host(&host), credentials);
            }
        }
        self.cred_helpers = config
            .cred_helpers
            .into_iter()
            .map(|(host, helper)| (normalize_host(&host), helper))
            .collect();
        self.creds_store = config.creds_store;
    }

    /// Resolve credentials for a host: explicit config first, then the
    /// per-host helper, the configured store, the global helper, and
    /// finally the well-known cloud helpers for matching hosts.
    pub fn resolve(&self, host: &str) -> Option<Credentials> {
        let host = normalize_host(host);
        if let Some(credentials) = self.auths.get(&host) {
            return Some(credentials.clone());
        }
        if let Some(helper) = self.cred_helpers.get(&host) {
            if let Some(credentials) = run_helper(&format!("docker-credential-{}", helper), &host) {
                return Some(credentials);
            }
        }
        if let Some(store) = &self.creds_store {
            if let Some(credentials) = run_helper(&format!("docker-credential-{}", store), &host) {
                return Some(credentials);
            }
        }
        if let Some(helper) = &self.global_helper {
            if let Some(credentials) = run_helper(helper, &host) {
                return Some(credentials);
            }
        }
        for helper in cloud_helpers_for(&host) {
            if let Some(credentials) = run_helper(helper, &host) {
                return Some(credentials);
            }
        }
        None
    }
}

fn docker_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("REGISTRY_AUTH_FILE") {
        return Some(PathBuf::from(path));
    }
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

fn normalize_host(host: &str) -> String {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    let host = host.strip_suffix('/').unwrap_or(host);
    // Docker Hub's legacy index address means the Docker Hub registry.
    if host == "index.docker.io/v1" || host == "index.docker.io" {
        return "registry-1.docker.io".to_string();
    }
    host.to_string()
}

fn decode_basic_auth(auth: &str) -> Option<Credentials> {
    let decoded = BASE64.decode(auth).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// The chained cloud helpers, tried in order for hosts they serve
fn cloud_helpers_for(host: &str) -> Vec<&'static str> {
    let mut helpers = Vec::new();
    if host.ends_with(".gcr.io") || host == "gcr.io" || host.ends_with("-docker.pkg.dev") {
        helpers.push("docker-credential-gcloud");
    }
    if host.ends_with(".amazonaws.com") {
        helpers.push("docker-credential-ecr-login");
    }
    if host.ends_with(".azurecr.io") {
        helpers.push("docker-credential-acr-env");
    }
    if host == "ghcr.io" {
        helpers.push("docker-credential-ghcr");
    }
    helpers
}

fn run_helper(binary: &str, host: &str) -> Option<Credentials> {
    use std::io::Write;
    let mut child = std::process::Command::new(binary)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    child
        .stdin
        .as_mut()?
        .write_all(host.as_bytes())
        .ok()?;
    let output = child.wait_with_output().ok()?;
    if !output.status.success() {
        return None;
    }
    let parsed: HelperOutput = serde_json::from_slice(&output.stdout).ok()?;
    Some(Credentials {
        username: parsed.username,
        password: parsed.secret,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug)]
struct AuthChallenge {
    realm: String,
    service: String,
    scope: Option<String>,
}

/// Bearer-token negotiation against one registry
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    client: Client,
    registry_url: String,
}

impl TokenAuthenticator {
    pub fn new(client: Client, registry_url: &str) -> Self {
        Self {
            client,
            registry_url: registry_url.trim_end_matches('/').to_string(),
        }
    }

    /// Obtain a token scoped to a repository, if the registry requires
    /// one. `push` widens the scope from `pull` to `push,pull`.
    pub async fn token_for_repository(
        &self,
        credentials: Option<&Credentials>,
        repository: &str,
        push: bool,
        logger: &Logger,
    ) -> Result<Option<String>> {
        let v2_url = format!("{}/v2/", self.registry_url);
        let response = send_with_retry(|| self.client.get(&v2_url), "registry API check").await?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            logger.verbose("Registry does not require authentication");
            return Ok(None);
        }
        let challenge = match response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
        {
            Some(header) if header.starts_with("Bearer ") => parse_challenge(header)?,
            Some(_) | None => {
                // Basic-only registries take credentials per request.
                return Ok(None);
            }
        };

        let scope = format!(
            "repository:{}:{}",
            repository,
            if push { "push,pull" } else { "pull" }
        );
        let mut token_url = format!(
            "{}?service={}&scope={}",
            challenge.realm, challenge.service, scope
        );
        if let Some(extra_scope) = &challenge.scope {
            token_url.push_str(&format!("&scope={}", extra_scope));
        }
        logger.verbose(&format!("Requesting token with scope: {}", scope));

        let response = send_with_retry(
            || {
                let mut request = self.client.get(&token_url);
                if let Some(credentials) = credentials {
                    request =
                        request.basic_auth(&credentials.username, Some(&credentials.password));
                }
                request
            },
            "auth token request",
        )
        .await?;
        // 401/403 from the token endpoint are terminal auth errors.
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ImageError::Auth(format!(
                "Token request for {} failed (status {}, keychain {}): {}",
                self.registry_url,
                status,
                if credentials.is_some() {
                    "credentials supplied"
                } else {
                    "anonymous"
                },
                body
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ImageError::Auth(format!("Failed to parse token response: {}", e)))?;
        let token = token
            .token
            .or(token.access_token)
            .ok_or_else(|| ImageError::Auth("No token in auth response".to_string()))?;
        logger.verbose("Authentication token obtained");
        Ok(Some(token))
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."`
fn parse_challenge(header: &str) -> Result<AuthChallenge> {
    let params = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ImageError::Auth("Invalid Bearer auth header".to_string()))?;

    let mut realm = String::new();
    let mut service = String::new();
    let mut scope = None;
    for param in params.split(',') {
        let param = param.trim();
        if let Some(eq_pos) = param.find('=') {
            let key = param[..eq_pos].trim();
            let value = param[eq_pos + 1..].trim().trim_matches('"');
            match key {
                "realm" => realm = value.to_string(),
                "service" => service = value.to_string(),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }
        }
    }
    if realm.is_empty() || service.is_empty() {
        return Err(ImageError::Auth(
            "Invalid auth challenge format".to_string(),
        ));
    }
    Ok(AuthChallenge {
        realm,
        service,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service, "registry.docker.io");
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );

        assert!(parse_challenge("Basic realm=x").is_err());
        assert!(parse_challenge("Bearer nothing-useful").is_err());
    }

    #[test]
    fn test_decode_basic_auth() {
        let encoded = BASE64.encode("user:pa:ss");
        let credentials = decode_basic_auth(&encoded).unwrap();
        assert_eq!(credentials.username, "user");
        // Only the first colon splits.
        assert_eq!(credentials.password, "pa:ss");
        assert!(decode_basic_auth("not base64 ***").is_none());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("https://ghcr.io/"), "ghcr.io");
        assert_eq!(normalize_host("index.docker.io/v1"), "registry-1.docker.io");
        assert_eq!(normalize_host("localhost:5000"), "localhost:5000");
    }

    #[test]
    fn test_keychain_prefers_explicit_auths() {
        let mut keychain = Keychain::default();
        keychain.load_config(DockerConfigFile {
            auths: HashMap::from([(
                "registry.example.com".to_string(),
                DockerAuthEntry {
                    auth: Some(BASE64.encode("alice:secret")),
                    username: None,
                    password: None,
                },
            )]),
            cred_helpers: HashMap::new(),
            creds_store: None,
        });
        let credentials = keychain.resolve("https://registry.example.com/").unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "secret");
        assert!(keychain.resolve("other.example.com").is_none());
    }

    #[test]
    fn test_cloud_helper_routing() {
        assert_eq!(
            cloud_helpers_for("eu.gcr.io"),
            vec!["docker-credential-gcloud"]
        );
        assert_eq!(
            cloud_helpers_for("123.dkr.ecr.us-east-1.amazonaws.com"),
            vec!["docker-credential-ecr-login"]
        );
        assert_eq!(
            cloud_helpers_for("myorg.azurecr.io"),
            vec!["docker-credential-acr-env"]
        );
        assert_eq!(cloud_helpers_for("ghcr.io"), vec!["docker-credential-ghcr"]);
        assert!(cloud_helpers_for("registry.example.com").is_empty());
    }
}
