use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use probekit_common::{util, Failure, FailureKind, Settings};
use probekit_dns::Resolve;
use probekit_http::{request_json_object, Headers};
use serde::{Deserialize, Serialize};

/// Probe credentials and session state for the orchestrator registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Authentication {
    pub username: String,
    pub password: String,
    #[serde(skip)]
    pub auth_token: String,
    #[serde(skip)]
    pub expiry_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub logged_in: bool,
}

impl Authentication {
    /// Loads {username, password} from the secrets file.
    pub fn load(path: &Path) -> Result<Self, Failure> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Failure::with_reason(FailureKind::FileIo, format!("{}: {err}", path.display()))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Stores {username, password} as the secrets file.
    pub fn store(&self, path: &Path) -> Result<(), Failure> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).map_err(|err| {
            Failure::with_reason(FailureKind::FileIo, format!("{}: {err}", path.display()))
        })
    }

    /// A valid session lets `update` skip the login round trip.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.logged_in && self.expiry_time.map(|expiry| expiry >= now).unwrap_or(false)
    }
}

/// What the probe tells the registry about itself.
#[derive(Debug, Clone, Default)]
pub struct ClientMetadata {
    pub probe_asn: String,
    pub probe_cc: String,
    pub platform: String,
    pub software_name: String,
    pub software_version: String,
    pub supported_tests: Vec<String>,
    pub device_token: String,
    pub language: String,
    pub network_type: String,
    pub registry_url: String,
    pub secrets_path: PathBuf,
}

impl ClientMetadata {
    fn as_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "probe_asn": self.probe_asn,
            "probe_cc": self.probe_cc,
            "platform": self.platform,
            "software_name": self.software_name,
            "software_version": self.software_version,
            "supported_tests": self.supported_tests,
        });
        if !self.device_token.is_empty() {
            body["token"] = self.device_token.clone().into();
        }
        if !self.language.is_empty() {
            body["language"] = self.language.clone().into();
        }
        if !self.network_type.is_empty() {
            body["network_type"] = self.network_type.clone().into();
        }
        body
    }

    fn validate(&self) -> Result<(), Failure> {
        if self.probe_cc.is_empty()
            || self.probe_asn.is_empty()
            || self.platform.is_empty()
            || self.software_name.is_empty()
            || self.software_version.is_empty()
            || self.supported_tests.is_empty()
        {
            return Err(Failure::with_reason(
                FailureKind::MissingRequiredValue,
                "incomplete client metadata",
            ));
        }
        if (self.platform == "ios" || self.platform == "android") && self.device_token.is_empty()
        {
            return Err(Failure::with_reason(
                FailureKind::MissingRequiredValue,
                "mobile platforms require a device token",
            ));
        }
        Ok(())
    }
}

/// A freshly generated registry password.
pub fn make_password() -> String {
    util::random_printable(64)
}

/// Registers the probe. On success the returned credentials carry the
/// server-assigned client id as username.
pub async fn register_probe(
    metadata: &ClientMetadata,
    password: &str,
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<Authentication, Failure> {
    if let Err(failure) = metadata.validate() {
        // Errors are reported through an await point, never synchronously
        // from the call that scheduled the operation.
        tokio::task::yield_now().await;
        return Err(failure);
    }

    let mut body = metadata.as_json();
    body["password"] = password.into();
    let url = format!("{}/api/v1/register", metadata.registry_url);
    tracing::info!("registering probe with orchestrator");
    let (_response, reply) =
        request_json_object("POST", &url, &body, &Headers::new(), settings, resolver).await?;

    if let Some(error) = reply.get("error").and_then(|e| e.as_str()) {
        if error == "invalid request" {
            return Err(Failure::new(FailureKind::RegistryInvalidRequest));
        }
        return Err(Failure::with_reason(FailureKind::Generic, error.to_string()));
    }
    let client_id = reply
        .get("client_id")
        .and_then(|id| id.as_str())
        .ok_or_else(|| Failure::with_reason(FailureKind::JsonKey, "response has no client_id"))?;
    if client_id.is_empty() {
        return Err(Failure::new(FailureKind::RegistryEmptyClientId));
    }

    Ok(Authentication {
        username: client_id.to_string(),
        password: password.to_string(),
        ..Authentication::default()
    })
}

/// Logs in and stores the bearer token plus its expiry on `auth`.
pub async fn login(
    auth: &mut Authentication,
    registry_url: &str,
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<(), Failure> {
    if auth.username.is_empty() || auth.password.is_empty() {
        tracing::warn!("orchestrator: missing username or password");
        tokio::task::yield_now().await;
        return Err(Failure::with_reason(
            FailureKind::MissingRequiredValue,
            "missing username or password",
        ));
    }

    let body = serde_json::json!({
        "username": auth.username,
        "password": auth.password,
    });
    let url = format!("{registry_url}/api/v1/login");
    tracing::info!("logging in with orchestrator");
    let (_response, reply) =
        request_json_object("POST", &url, &body, &Headers::new(), settings, resolver).await?;

    if let Some(error) = reply.get("error").and_then(|e| e.as_str()) {
        return Err(match error {
            "wrong-username-password" => {
                Failure::new(FailureKind::RegistryWrongUsernamePassword)
            }
            "missing-username-password" => {
                Failure::new(FailureKind::RegistryMissingUsernamePassword)
            }
            other => Failure::with_reason(FailureKind::Generic, other.to_string()),
        });
    }

    let expire = reply
        .get("expire")
        .and_then(|e| e.as_str())
        .ok_or_else(|| Failure::with_reason(FailureKind::JsonKey, "response has no expire"))?;
    let token = reply
        .get("token")
        .and_then(|t| t.as_str())
        .ok_or_else(|| Failure::with_reason(FailureKind::JsonKey, "response has no token"))?;
    auth.expiry_time = Some(util::parse_iso8601_utc(expire)?);
    auth.auth_token = token.to_string();
    auth.logged_in = true;
    tracing::info!("logged in with orchestrator");
    Ok(())
}

/// Logs in only when the current session is not valid anymore.
pub async fn maybe_login(
    auth: &mut Authentication,
    registry_url: &str,
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<(), Failure> {
    if auth.is_valid() {
        tracing::debug!("orchestrator: auth token is valid, no need to login");
        tokio::task::yield_now().await;
        return Ok(());
    }
    login(auth, registry_url, settings, resolver).await
}

/// Pushes refreshed metadata, logging in first when needed.
pub async fn update(
    metadata: &ClientMetadata,
    auth: &mut Authentication,
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<(), Failure> {
    maybe_login(auth, &metadata.registry_url, settings, resolver).await?;

    let url = format!("{}/api/v1/update/{}", metadata.registry_url, auth.username);
    let headers: Headers =
        [("Authorization", format!("Bearer {}", auth.auth_token))].into_iter().collect();
    let (_response, reply) =
        request_json_object("PUT", &url, &metadata.as_json(), &headers, settings, resolver)
            .await?;

    if let Some(error) = reply.get("error").and_then(|e| e.as_str()) {
        tracing::warn!(error, "orchestrator: update failed");
        return Err(Failure::new(FailureKind::RegistryInvalidRequest));
    }
    if reply.get("status").and_then(|s| s.as_str()) != Some("ok") {
        return Err(Failure::new(FailureKind::RegistryInvalidRequest));
    }
    Ok(())
}

/// Registers once: an existing secrets file means the probe is already
/// registered, otherwise register and persist the credentials.
pub async fn do_register_probe(
    metadata: &ClientMetadata,
    password: &str,
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<(), Failure> {
    if Authentication::load(&metadata.secrets_path).is_ok() {
        tracing::info!("this probe is already registered");
        tokio::task::yield_now().await;
        return Ok(());
    }
    let auth = register_probe(metadata, password, settings, resolver).await?;
    auth.store(&metadata.secrets_path)
}

/// Loads the stored credentials and pushes a metadata update.
pub async fn do_update(
    metadata: &ClientMetadata,
    settings: &Settings,
    resolver: &dyn Resolve,
) -> Result<(), Failure> {
    let mut auth = match Authentication::load(&metadata.secrets_path) {
        Ok(auth) => auth,
        Err(failure) => {
            tokio::task::yield_now().await;
            return Err(failure);
        }
    };
    update(metadata, &mut auth, settings, resolver).await
}
