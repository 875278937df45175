//! Provisioning endpoints: tenant registration and token issuance.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::error;

use telemetra_core::{ProductId, TenantId};
use telemetra_provision::ProvisionError;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub id: String,
    pub display_name: String,
}

/// Broker credentials are returned exactly once, at creation; the
/// password is not recoverable afterwards.
#[derive(Debug, Serialize)]
pub struct CreateTenantResponse {
    pub id: String,
    pub broker_username: String,
    pub broker_password: String,
}

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    pub product_id: String,
    /// Logical name, used as a queue-name segment.
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct IssueTokenResponse {
    pub token: String,
    pub name: String,
    pub product_id: String,
    pub vhost: String,
    /// Full broker names of the provisioned queues, one per event kind.
    pub queues: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

/// `POST /v1/tenants` -- register a tenant and mint its broker principal.
pub async fn create_tenant(
    State(state): State<AppState>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<CreateTenantResponse>), ApiError> {
    if req.id.is_empty() {
        return Err(bad_request("tenant id must not be empty"));
    }
    let record = state
        .provisioner
        .create_tenant(&TenantId::from(req.id.as_str()), &req.display_name)
        .await
        .map_err(into_api_error)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTenantResponse {
            id: record.id.as_str().to_owned(),
            broker_username: record.broker_username,
            broker_password: record.broker_password,
        }),
    ))
}

/// `POST /v1/tenants/{tenant}/tokens` -- issue a token and provision its
/// per-kind queues.
pub async fn issue_token(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<(StatusCode, Json<IssueTokenResponse>), ApiError> {
    if req.product_id.is_empty() {
        return Err(bad_request("product_id must not be empty"));
    }
    let grant = state
        .provisioner
        .issue_token(
            &TenantId::from(tenant.as_str()),
            &ProductId::from(req.product_id.as_str()),
            &req.name,
        )
        .await
        .map_err(into_api_error)?;
    Ok((
        StatusCode::CREATED,
        Json(IssueTokenResponse {
            token: grant.token.value.as_str().to_owned(),
            name: grant.token.name,
            product_id: grant.token.product.as_str().to_owned(),
            vhost: grant.token.vhost.as_str().to_owned(),
            queues: grant.queues.into_iter().map(|q| q.full_name).collect(),
        }),
    ))
}

fn bad_request(msg: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: msg.to_owned(),
        }),
    )
}

fn into_api_error(err: ProvisionError) -> ApiError {
    let status = match &err {
        ProvisionError::TenantExists(_) => StatusCode::CONFLICT,
        ProvisionError::UnknownTenant(_) => StatusCode::NOT_FOUND,
        ProvisionError::Invalid(_) => StatusCode::BAD_REQUEST,
        ProvisionError::Broker(_) => StatusCode::BAD_GATEWAY,
        ProvisionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() || status == StatusCode::BAD_GATEWAY {
        error!(error = %err, "provisioning failed");
    }
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetra_broker::BrokerError;

    #[test]
    fn provision_errors_map_to_statuses() {
        let cases = [
            (
                into_api_error(ProvisionError::TenantExists("acme".into())).0,
                StatusCode::CONFLICT,
            ),
            (
                into_api_error(ProvisionError::UnknownTenant("acme".into())).0,
                StatusCode::NOT_FOUND,
            ),
            (
                into_api_error(ProvisionError::Invalid("bad name".into())).0,
                StatusCode::BAD_REQUEST,
            ),
            (
                into_api_error(BrokerError::Connection("refused".into()).into()).0,
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (got, want) in cases {
            assert_eq!(got, want);
        }
    }
}
