use serde::Deserialize;

/// Connection settings for the RabbitMQ management API.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMqConfig {
    /// Management API base URL, e.g. `http://localhost:15672/api`.
    pub api_url: String,
    /// Administrative principal used for provisioning calls.
    pub admin_user: String,
    pub admin_password: String,
    /// Tags assigned to minted tenant principals.
    #[serde(default = "default_tags")]
    pub account_tags: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_tags() -> String {
    "management".to_owned()
}

fn default_timeout() -> u64 {
    10
}

impl RabbitMqConfig {
    #[must_use]
    pub fn new(api_url: impl Into<String>, admin_user: impl Into<String>, admin_password: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            admin_user: admin_user.into(),
            admin_password: admin_password.into(),
            account_tags: default_tags(),
            timeout_seconds: default_timeout(),
        }
    }
}
