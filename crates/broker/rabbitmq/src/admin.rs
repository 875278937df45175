//! [`BrokerAdmin`] over the RabbitMQ management HTTP API.
//!
//! Status-code contract, which the provisioning flow depends on:
//! - `PUT /users/{u}`: only issued after a 404 existence probe; an existing
//!   principal is `AlreadyExists` (its password cannot be recovered).
//! - `PUT /vhosts/{v}`, `PUT /queues/{v}/{q}`: 201 and 204 are both
//!   success (204 = already present), anything else is `Rejected`.
//! - `DELETE`: 404 is `NotFound`, 200/204 success.
//!
//! Vhost creation also grants the tenant principal write-only permission
//! (configure "", write ".*", read ""): SDK clients publish, they never
//! consume or reshape topology.

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use telemetra_broker::{AccountCredentials, BrokerAdmin, BrokerError};
use telemetra_core::{TenantId, VhostId};

use crate::config::RabbitMqConfig;

/// Length of generated principal passwords.
const PASSWORD_LEN: usize = 64;

/// RabbitMQ management-API client.
pub struct RabbitMqAdmin {
    http: reqwest::Client,
    config: RabbitMqConfig,
}

impl RabbitMqAdmin {
    /// Build a client from config.
    ///
    /// Fails with [`BrokerError::Connection`] if the HTTP client cannot be
    /// constructed (TLS backend initialization).
    pub fn new(config: RabbitMqConfig) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.api_url.trim_end_matches('/'))
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.basic_auth(&self.config.admin_user, Some(&self.config.admin_password))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, BrokerError> {
        self.authed(req)
            .send()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    async fn rejected(resp: reqwest::Response) -> BrokerError {
        let status = resp.status().as_u16();
        let detail = resp.text().await.unwrap_or_default();
        BrokerError::Rejected { status, detail }
    }

    fn mint_password() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LEN)
            .map(char::from)
            .collect()
    }
}

#[async_trait]
impl BrokerAdmin for RabbitMqAdmin {
    #[instrument(skip(self))]
    async fn account_exists(&self, username: &str) -> Result<bool, BrokerError> {
        let resp = self
            .send(self.http.get(self.url(&format!("users/{username}"))))
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::rejected(resp).await),
        }
    }

    #[instrument(skip(self))]
    async fn create_account(&self, tenant: &TenantId) -> Result<AccountCredentials, BrokerError> {
        let username = tenant.to_string();
        if self.account_exists(&username).await? {
            return Err(BrokerError::AlreadyExists(username));
        }

        let password = Self::mint_password();
        let resp = self
            .send(
                self.http
                    .put(self.url(&format!("users/{username}")))
                    .json(&serde_json::json!({
                        "password": password,
                        "tags": self.config.account_tags,
                    })),
            )
            .await?;

        match resp.status() {
            StatusCode::CREATED => {
                debug!(%username, "broker principal created");
                Ok(AccountCredentials { username, password })
            }
            _ => Err(Self::rejected(resp).await),
        }
    }

    #[instrument(skip(self))]
    async fn delete_account(&self, username: &str) -> Result<(), BrokerError> {
        let resp = self
            .send(self.http.delete(self.url(&format!("users/{username}"))))
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(BrokerError::NotFound(format!("account {username}"))),
            _ => Err(Self::rejected(resp).await),
        }
    }

    #[instrument(skip(self))]
    async fn create_vhost(&self, tenant: &TenantId) -> Result<VhostId, BrokerError> {
        let vhost = format!("{tenant}_vhost");
        let resp = self
            .send(self.http.put(self.url(&format!("vhosts/{vhost}"))))
            .await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => {}
            _ => return Err(Self::rejected(resp).await),
        }

        // Write-only grant for the tenant's own principal.
        let resp = self
            .send(
                self.http
                    .put(self.url(&format!("permissions/{vhost}/{tenant}")))
                    .json(&serde_json::json!({
                        "configure": "",
                        "write": ".*",
                        "read": "",
                    })),
            )
            .await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => {
                debug!(%vhost, "vhost provisioned");
                Ok(VhostId::from(vhost))
            }
            _ => Err(Self::rejected(resp).await),
        }
    }

    #[instrument(skip(self))]
    async fn delete_vhost(&self, vhost: &VhostId) -> Result<(), BrokerError> {
        let resp = self
            .send(self.http.delete(self.url(&format!("vhosts/{vhost}"))))
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(BrokerError::NotFound(format!("vhost {vhost}"))),
            _ => Err(Self::rejected(resp).await),
        }
    }

    #[instrument(skip(self))]
    async fn create_queue(&self, vhost: &VhostId, full_name: &str) -> Result<(), BrokerError> {
        let resp = self
            .send(
                self.http
                    .put(self.url(&format!("queues/{vhost}/{full_name}")))
                    .json(&serde_json::json!({ "durable": true })),
            )
            .await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => {
                debug!(%vhost, queue = %full_name, "durable queue declared");
                Ok(())
            }
            _ => Err(Self::rejected(resp).await),
        }
    }

    #[instrument(skip(self))]
    async fn delete_queue(&self, vhost: &VhostId, full_name: &str) -> Result<(), BrokerError> {
        let resp = self
            .send(
                self.http
                    .delete(self.url(&format!("queues/{vhost}/{full_name}"))),
            )
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(BrokerError::NotFound(format!("queue {full_name}"))),
            _ => Err(Self::rejected(resp).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_passwords_are_long_and_distinct() {
        let a = RabbitMqAdmin::mint_password();
        let b = RabbitMqAdmin::mint_password();
        assert_eq!(a.len(), PASSWORD_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn url_joins_without_double_slash() {
        let admin = RabbitMqAdmin::new(RabbitMqConfig::new(
            "http://mq:15672/api/",
            "guest",
            "guest",
        ))
        .unwrap();
        assert_eq!(admin.url("users/u1"), "http://mq:15672/api/users/u1");
    }
}
