//! Consul agent registration.

use async_trait::async_trait;
use serde::Serialize;
use tether_core::{DirectoryError, HealthCheck, ServiceDirectory, ServiceRegistration};
use tether_settings::TetherSettings;
use tracing::info;

const REGISTER_PATH: &str = "/v1/agent/service/register";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Registers this process with a Consul agent.
#[derive(Clone, Debug)]
pub struct ConsulDirectory {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ConsulDirectory {
    /// Agent at `{scheme}://{address}`.
    pub fn new(scheme: &str, address: &str, token: Option<String>) -> Self {
        Self::with_base_url(format!("{scheme}://{address}"), token)
    }

    /// Agent at an explicit base URL.
    pub fn with_base_url(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token,
        }
    }

    /// Agent described by the discovery settings.
    pub fn from_settings(settings: &TetherSettings) -> Self {
        let d = &settings.discovery;
        Self::new(&d.scheme, &d.consul_address, d.token.clone())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: u16,
    check: AgentServiceCheck<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck<'a> {
    #[serde(rename = "HTTP")]
    http: &'a str,
    timeout: &'a str,
    interval: &'a str,
    deregister_critical_service_after: &'a str,
}

impl<'a> From<&'a ServiceRegistration> for AgentServiceRegistration<'a> {
    fn from(r: &'a ServiceRegistration) -> Self {
        Self {
            id: &r.id,
            name: &r.name,
            tags: &r.tags,
            address: &r.address,
            port: r.port,
            check: AgentServiceCheck {
                http: &r.check.url,
                timeout: &r.check.timeout,
                interval: &r.check.interval,
                deregister_critical_service_after: &r.check.deregister_after,
            },
        }
    }
}

#[async_trait]
impl ServiceDirectory for ConsulDirectory {
    async fn register(&self, registration: &ServiceRegistration) -> Result<(), DirectoryError> {
        let url = format!("{}{REGISTER_PATH}", self.base_url);
        let mut request = self
            .client
            .put(&url)
            .json(&AgentServiceRegistration::from(registration));
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            service_id = %registration.id,
            service = %registration.name,
            check = %registration.check.url,
            "registered with service directory"
        );
        Ok(())
    }
}

/// Registration for this process listening on `port`.
pub fn registration_from_settings(settings: &TetherSettings, port: u16) -> ServiceRegistration {
    let d = &settings.discovery;
    let address = settings
        .server
        .advertise_address
        .clone()
        .unwrap_or_else(|| settings.server.host.clone());
    let scheme = if d.tls { "https" } else { "http" };
    ServiceRegistration {
        id: d
            .service_id
            .clone()
            .unwrap_or_else(|| format!("{}-{port}", d.service_name)),
        name: d.service_name.clone(),
        tags: d.tags.clone(),
        check: HealthCheck {
            url: format!("{scheme}://{address}:{port}{}", d.check.uri),
            interval: d.check.interval.clone(),
            timeout: d.check.timeout.clone(),
            deregister_after: d.check.deregister_after.clone(),
        },
        address,
        port,
    }
}
