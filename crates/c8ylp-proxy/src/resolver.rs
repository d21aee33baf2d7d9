//! Cumulocity REST interactions.
//!
//! Turns a device external identity plus a named remote-access
//! configuration into an authenticated tunnel descriptor: tenant
//! discovery, token validation (or OAuth login), managed-object lookup,
//! configuration lookup, tunnel URL construction.
//!
//! Only idempotent GETs are retried, at most twice with 250 ms and 1 s
//! backoff, and only on connection failures and 5xx responses.
//! Authentication failures and 404s surface immediately.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use c8ylp_core::{ProxyError, ProxyResult, SecretToken, TunnelDescriptor};

/// Per-request timeout for REST calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff schedule; the length bounds the retry count.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(250), Duration::from_secs(1)];

/// The login option type carrying the tenant id.
const OAUTH2_INTERNAL: &str = "OAUTH2_INTERNAL";

/// Caller credentials: a bearer token, or username and password for the
/// OAuth login flow.
#[derive(Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tfa_code: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tfa_code", &self.tfa_code.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Input of a full resolve.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub host: String,
    pub tenant: Option<String>,
    pub credentials: Credentials,
    pub device: String,
    pub external_type: String,
    pub config_name: String,
    pub verify_tls: bool,
}

#[derive(Debug, Deserialize)]
struct LoginOptionCollection {
    #[serde(default, rename = "loginOptions")]
    login_options: Vec<LoginOption>,
}

#[derive(Debug, Deserialize)]
struct LoginOption {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "initRequest")]
    init_request: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalId {
    #[serde(rename = "managedObject")]
    managed_object: ManagedObjectRef,
}

#[derive(Debug, Deserialize)]
struct ManagedObjectRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RemoteAccessConfiguration {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Cumulocity REST client scoped to one normalized base URL.
pub struct CumulocityResolver {
    http: reqwest::Client,
    base: Url,
}

impl CumulocityResolver {
    /// Build a resolver for `host`, normalizing it first.
    pub fn new(host: &str, verify_tls: bool) -> ProxyResult<Self> {
        let base = normalize_host(host)?;

        let mut builder = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .cookie_store(true);
        if !verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| ProxyError::Http(format!("http client: {e}")))?;

        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Run the whole resolve pipeline and produce the tunnel descriptor.
    pub async fn resolve(&self, request: &ResolveRequest) -> ProxyResult<TunnelDescriptor> {
        let tenant = match &request.tenant {
            Some(tenant) => tenant.clone(),
            None => self.resolve_tenant().await?,
        };
        debug!(tenant = %tenant, "using tenant");

        let token = match &request.credentials.token {
            Some(token) => {
                self.validate_token(token).await?;
                debug!("bearer token validated");
                token.clone()
            }
            None => {
                let user = request.credentials.user.as_deref().ok_or_else(|| {
                    ProxyError::Auth("no token and no username provided".into())
                })?;
                let password = request.credentials.password.as_deref().ok_or_else(|| {
                    ProxyError::Auth("no token and no password provided".into())
                })?;
                let token = self
                    .login_oauth(
                        &tenant,
                        user,
                        password,
                        request.credentials.tfa_code.as_deref(),
                    )
                    .await?;
                info!(user = %user, "login successful");
                token
            }
        };
        let token = SecretToken::new(token);

        let device_id = self
            .device_id(&token, &request.external_type, &request.device)
            .await?;
        debug!(device = %request.device, device_id = %device_id, "device resolved");

        let config_id = self
            .configuration_id(&token, &device_id, &request.config_name)
            .await?;
        debug!(config = %request.config_name, config_id = %config_id, "configuration resolved");

        Ok(TunnelDescriptor {
            base_url: self.base.clone(),
            tenant,
            device_id,
            config_id,
            token,
            verify_tls: request.verify_tls,
        })
    }

    /// Discover the tenant id from the public login options.
    ///
    /// The `OAUTH2_INTERNAL` option is picked wherever it appears in the
    /// list; SSO options listed earlier must not shadow it.
    pub async fn resolve_tenant(&self) -> ProxyResult<String> {
        let response = self.get_with_retry("/tenant/loginOptions", None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::TenantNotFound(format!(
                "loginOptions returned status {status}"
            )));
        }

        let body: LoginOptionCollection = response
            .json()
            .await
            .map_err(|e| ProxyError::TenantNotFound(format!("invalid loginOptions body: {e}")))?;

        let option = body
            .login_options
            .iter()
            .find(|option| option.kind == OAUTH2_INTERNAL)
            .ok_or_else(|| {
                ProxyError::TenantNotFound("no OAUTH2_INTERNAL login option".into())
            })?;

        option
            .init_request
            .as_deref()
            .and_then(tenant_from_init_request)
            .map(str::to_string)
            .ok_or_else(|| {
                ProxyError::TenantNotFound("login option carries no tenant id".into())
            })
    }

    /// Confirm a bearer token against the current tenant endpoint.
    pub async fn validate_token(&self, token: &str) -> ProxyResult<()> {
        let response = self
            .get_with_retry("/tenant/currentTenant", Some(token))
            .await?;
        let status = response.status();
        match status {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProxyError::Auth(format!(
                "token rejected by {} (status {status})",
                redacted_host(&self.base)
            ))),
            s if s.is_server_error() => Err(ProxyError::TunnelUnavailable(format!(
                "token validation failed with status {s}"
            ))),
            s => Err(ProxyError::Http(format!(
                "unexpected status {s} validating token"
            ))),
        }
    }

    /// OAuth password-grant login; yields the bearer token carried in the
    /// `authorization` cookie. Never retried.
    pub async fn login_oauth(
        &self,
        tenant: &str,
        user: &str,
        password: &str,
        tfa_code: Option<&str>,
    ) -> ProxyResult<String> {
        let mut url = self.join("/tenant/oauth")?;
        url.set_query(Some(&format!("tenant_id={tenant}")));

        let form = [
            ("grant_type", "PASSWORD"),
            ("username", user),
            ("password", password),
            ("tfa_code", tfa_code.unwrap_or("")),
        ];

        let response = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProxyError::Http(format!("login request failed: {e}")))?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                let token = response
                    .cookies()
                    .find(|cookie| cookie.name() == "authorization")
                    .map(|cookie| cookie.value().to_string());
                token.ok_or_else(|| {
                    ProxyError::Auth("login succeeded but no authorization cookie".into())
                })
            }
            StatusCode::UNAUTHORIZED => {
                let text = response.text().await.unwrap_or_default();
                if text.contains("TFA") && tfa_code.is_none() {
                    return Err(ProxyError::Auth("TFA code required".into()));
                }
                let message = serde_json::from_str::<ErrorBody>(&text)
                    .ok()
                    .and_then(|body| body.message)
                    .unwrap_or_else(|| "user is not authorized to access tenant".into());
                Err(ProxyError::Auth(message))
            }
            s if s.is_server_error() => Err(ProxyError::TunnelUnavailable(format!(
                "login failed with status {s}"
            ))),
            s => Err(ProxyError::Http(format!("unexpected login status {s}"))),
        }
    }

    /// Map a device external identity to its managed object id.
    pub async fn device_id(
        &self,
        token: &SecretToken,
        external_type: &str,
        external_id: &str,
    ) -> ProxyResult<String> {
        let path = format!("/identity/externalIds/{external_type}/{external_id}");
        let response = self.get_with_retry(&path, Some(token.expose())).await?;
        let status = response.status();
        match status {
            StatusCode::OK => {
                let body: ExternalId = response.json().await.map_err(|e| {
                    ProxyError::Http(format!("invalid external id body: {e}"))
                })?;
                Ok(body.managed_object.id)
            }
            StatusCode::NOT_FOUND => Err(ProxyError::DeviceNotFound(format!(
                "no device with external id '{external_id}' ({external_type})"
            ))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProxyError::Auth(format!(
                "not authorized to read device '{external_id}'"
            ))),
            s => Err(ProxyError::Http(format!(
                "unexpected status {s} looking up device"
            ))),
        }
    }

    /// Find the remote-access configuration matching `name` exactly.
    pub async fn configuration_id(
        &self,
        token: &SecretToken,
        device_id: &str,
        name: &str,
    ) -> ProxyResult<String> {
        let path = format!("/service/remoteaccess/devices/{device_id}/configurations");
        let response = self.get_with_retry(&path, Some(token.expose())).await?;
        let status = response.status();
        match status {
            StatusCode::OK => {
                let configurations: Vec<RemoteAccessConfiguration> =
                    response.json().await.map_err(|e| {
                        ProxyError::Http(format!("invalid configurations body: {e}"))
                    })?;
                configurations
                    .into_iter()
                    .find(|config| config.name == name)
                    .map(|config| config.id)
                    .ok_or_else(|| {
                        ProxyError::ConfigurationNotFound(format!(
                            "no remote access configuration named '{name}'"
                        ))
                    })
            }
            StatusCode::NOT_FOUND => Err(ProxyError::DeviceNotFound(format!(
                "device {device_id} has no remote access service"
            ))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProxyError::Auth(
                "not authorized for remote access configurations".into(),
            )),
            s => Err(ProxyError::Http(format!(
                "unexpected status {s} listing configurations"
            ))),
        }
    }

    fn join(&self, path: &str) -> ProxyResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ProxyError::Http(format!("invalid path {path}: {e}")))
    }

    /// GET with the narrow retry policy: connection errors and 5xx retry
    /// through the backoff schedule, everything else returns immediately.
    async fn get_with_retry(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> ProxyResult<reqwest::Response> {
        let url = self.join(path)?;
        let mut attempt = 0usize;
        loop {
            let mut request = self.http.get(url.clone());
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }

            let retry_in = match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    if attempt >= RETRY_BACKOFF.len() {
                        return Ok(response);
                    }
                    debug!(path, status = %response.status(), "server error, will retry");
                    RETRY_BACKOFF[attempt]
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    if attempt >= RETRY_BACKOFF.len() {
                        return Err(ProxyError::Http(format!("GET {path} failed: {e}")));
                    }
                    debug!(path, error = %e, "connection error, will retry");
                    RETRY_BACKOFF[attempt]
                }
                Err(e) => return Err(ProxyError::Http(format!("GET {path} failed: {e}"))),
            };

            warn!(path, attempt, delay = ?retry_in, "retrying request");
            tokio::time::sleep(retry_in).await;
            attempt += 1;
        }
    }
}

/// Normalize a user-supplied host into a base URL.
///
/// Whitespace and trailing slashes are trimmed and `https://` is assumed
/// when no scheme is given.
pub fn normalize_host(raw: &str) -> ProxyResult<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ProxyError::InvalidConfig("empty host".into()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| ProxyError::InvalidConfig(format!("invalid host '{trimmed}': {e}")))?;
    if url.host_str().is_none() {
        return Err(ProxyError::InvalidConfig(format!(
            "host '{trimmed}' has no authority"
        )));
    }
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProxyError::InvalidConfig(format!(
            "unsupported scheme '{other}'"
        ))),
    }
}

/// Pull the tenant id out of an `initRequest` value such as
/// `https://host/tenant/oauth?tenant_id=t123`.
fn tenant_from_init_request(init_request: &str) -> Option<&str> {
    let (_, after) = init_request.split_once("tenant_id=")?;
    let tenant = after.split('&').next().unwrap_or(after);
    if tenant.is_empty() {
        None
    } else {
        Some(tenant)
    }
}

fn redacted_host(url: &Url) -> &str {
    url.host_str().unwrap_or("<unknown>")
}
