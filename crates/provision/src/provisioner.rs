//! The registration-time flow: tenant accounts, token issuance, queue
//! provisioning.
//!
//! Issuance either completes fully or leaves nothing behind: broker
//! artifacts created before a failure are deleted again, and the catalog
//! refresh signal fires only after both the broker and the store agree.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{info, instrument, warn};

use telemetra_broker::{BrokerAdmin, BrokerError};
use telemetra_core::{
    EventError, ProductId, QueueKind, QueueRecord, TenantId, Token, TokenValue, VhostId,
    queue_name,
};
use telemetra_store::{EventStore, TenantRecord};

use crate::error::ProvisionError;
use crate::refresh::CatalogRefresh;

/// Length of minted token values, matching broker password material.
const TOKEN_LEN: usize = 64;

/// The result of a successful token issuance.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: Token,
    pub queues: Vec<QueueRecord>,
}

/// Orchestrates tenant and token provisioning across the broker and store.
pub struct Provisioner {
    admin: Arc<dyn BrokerAdmin>,
    store: Arc<dyn EventStore>,
    refresh: CatalogRefresh,
}

impl Provisioner {
    pub fn new(
        admin: Arc<dyn BrokerAdmin>,
        store: Arc<dyn EventStore>,
        refresh: CatalogRefresh,
    ) -> Self {
        Self {
            admin,
            store,
            refresh,
        }
    }

    /// The refresh signal consumers subscribe to.
    #[must_use]
    pub fn refresh(&self) -> &CatalogRefresh {
        &self.refresh
    }

    fn mint_token_value() -> TokenValue {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        TokenValue::from(value)
    }

    /// Register a tenant: broker principal first, then the store record.
    ///
    /// An existing principal is fatal ([`ProvisionError::TenantExists`]) --
    /// its password cannot be recovered, so re-registration must be an
    /// explicit manual operation.
    #[instrument(skip(self, display_name))]
    pub async fn create_tenant(
        &self,
        id: &TenantId,
        display_name: &str,
    ) -> Result<TenantRecord, ProvisionError> {
        let credentials = self.admin.create_account(id).await.map_err(|e| match e {
            BrokerError::AlreadyExists(_) => ProvisionError::TenantExists(id.to_string()),
            other => ProvisionError::Broker(other),
        })?;

        let record = TenantRecord {
            id: id.clone(),
            display_name: display_name.to_owned(),
            broker_username: credentials.username,
            broker_password: credentials.password,
        };

        if let Err(err) = self.store.insert_tenant(&record).await {
            // Undo the principal so a retry can start clean.
            if let Err(rollback) = self.admin.delete_account(&record.broker_username).await {
                warn!(
                    tenant = %id,
                    error = %rollback,
                    "failed to roll back broker account after store error"
                );
            }
            return Err(err.into());
        }

        info!(tenant = %id, "tenant provisioned");
        Ok(record)
    }

    /// Issue a token for a product: vhost, minted credential, one durable
    /// queue per event kind, and the matching catalog records.
    ///
    /// On any failure the broker queues created so far are deleted, so the
    /// catalog never references queues that do not exist and the broker
    /// never carries queues the catalog does not know.
    #[instrument(skip(self), fields(tenant = %tenant, product = %product))]
    pub async fn issue_token(
        &self,
        tenant: &TenantId,
        product: &ProductId,
        name: &str,
    ) -> Result<TokenGrant, ProvisionError> {
        if self.store.get_tenant(tenant).await?.is_none() {
            return Err(ProvisionError::UnknownTenant(tenant.to_string()));
        }

        // Validate every queue name before touching the broker.
        let vhost = VhostId::from(format!("{tenant}_vhost"));
        let mut names = Vec::with_capacity(QueueKind::ALL.len());
        for kind in QueueKind::ALL {
            let full = queue_name(tenant, &vhost, name, kind).map_err(|e| match e {
                EventError::Validation(msg) => ProvisionError::Invalid(msg),
                other => ProvisionError::Invalid(other.to_string()),
            })?;
            names.push((kind, full));
        }

        let vhost = self.admin.create_vhost(tenant).await?;

        let mut created: Vec<String> = Vec::new();
        for (_, full) in &names {
            if let Err(err) = self.admin.create_queue(&vhost, full).await {
                self.rollback_queues(&vhost, &created).await;
                return Err(err.into());
            }
            created.push(full.clone());
        }

        let token = Token {
            value: Self::mint_token_value(),
            name: name.to_owned(),
            tenant: tenant.clone(),
            product: product.clone(),
            vhost: vhost.clone(),
            created_at: Utc::now(),
        };

        if let Err(err) = self.store.insert_token(&token).await {
            self.rollback_queues(&vhost, &created).await;
            return Err(err.into());
        }

        let queues: Vec<QueueRecord> = names
            .into_iter()
            .map(|(kind, full_name)| QueueRecord {
                full_name,
                logical_name: name.to_owned(),
                kind,
                token: token.value.clone(),
                vhost: vhost.clone(),
            })
            .collect();

        for queue in &queues {
            if let Err(err) = self.store.insert_queue(queue).await {
                // Undo both sides; partial catalog state must not survive.
                if let Err(rollback) = self.store.delete_queues_for_token(&token.value).await {
                    warn!(
                        token = %token.value,
                        error = %rollback,
                        "failed to roll back catalog records after store error"
                    );
                }
                if let Err(rollback) = self.store.delete_token(&token.value).await {
                    warn!(
                        token = %token.value,
                        error = %rollback,
                        "failed to roll back token record after store error"
                    );
                }
                self.rollback_queues(&vhost, &created).await;
                return Err(err.into());
            }
        }

        self.refresh.notify();
        info!(
            tenant = %tenant,
            product = %product,
            queues = queues.len(),
            "token issued"
        );
        Ok(TokenGrant { token, queues })
    }

    /// Retire a token: delete its broker queues and catalog records, then
    /// signal a refresh. Queues already gone from the broker are tolerated.
    #[instrument(skip(self, token), fields(token_name = %token.name))]
    pub async fn retire_token(&self, token: &Token) -> Result<(), ProvisionError> {
        let queues = self.store.list_queues().await?;
        for queue in queues.iter().filter(|q| q.token == token.value) {
            match self.admin.delete_queue(&queue.vhost, &queue.full_name).await {
                Ok(()) | Err(BrokerError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.store.delete_queues_for_token(&token.value).await?;
        self.refresh.notify();
        info!(token_name = %token.name, "token retired");
        Ok(())
    }

    /// Best-effort deletion of queues created earlier in a failed issuance.
    async fn rollback_queues(&self, vhost: &VhostId, names: &[String]) {
        for full in names {
            if let Err(err) = self.admin.delete_queue(vhost, full).await {
                warn!(queue = %full, error = %err, "failed to roll back broker queue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetra_broker_memory::MemoryBroker;
    use telemetra_store_memory::MemoryEventStore;

    fn fixture() -> (MemoryBroker, MemoryEventStore, Provisioner) {
        let broker = MemoryBroker::new();
        let store = MemoryEventStore::new();
        let provisioner = Provisioner::new(
            Arc::new(broker.clone()),
            Arc::new(store.clone()),
            CatalogRefresh::new(),
        );
        (broker, store, provisioner)
    }

    async fn tenant(provisioner: &Provisioner) -> TenantId {
        let id = TenantId::from("studio");
        provisioner.create_tenant(&id, "Studio Red").await.unwrap();
        id
    }

    #[tokio::test]
    async fn create_tenant_mints_credentials() {
        let (broker, store, provisioner) = fixture();
        let record = provisioner
            .create_tenant(&TenantId::from("studio"), "Studio Red")
            .await
            .unwrap();
        assert_eq!(record.broker_username, "studio");
        assert_eq!(record.broker_password.len(), 64);
        assert!(broker.account_exists("studio").await.unwrap());
        assert!(
            store
                .get_tenant(&TenantId::from("studio"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn second_registration_is_fatal() {
        let (_, _, provisioner) = fixture();
        let id = tenant(&provisioner).await;
        let err = provisioner.create_tenant(&id, "again").await.unwrap_err();
        assert!(matches!(err, ProvisionError::TenantExists(_)));
    }

    #[tokio::test]
    async fn issue_token_provisions_one_queue_per_kind() {
        let (broker, store, provisioner) = fixture();
        let id = tenant(&provisioner).await;
        let mut refresh_rx = provisioner.refresh().subscribe();
        refresh_rx.borrow_and_update();

        let grant = provisioner
            .issue_token(&id, &ProductId::from("7"), "main")
            .await
            .unwrap();

        assert_eq!(grant.queues.len(), QueueKind::ALL.len());
        assert_eq!(grant.token.value.as_str().len(), TOKEN_LEN);
        assert_eq!(grant.token.vhost.as_str(), "studio_vhost");

        // Broker queues exist and accept publishes.
        for queue in &grant.queues {
            assert_eq!(queue.logical_name, "main");
            broker.publish(&queue.full_name, b"x".to_vec()).unwrap();
        }

        // Catalog records round-trip through the store.
        let catalog = store.list_queues().await.unwrap();
        assert_eq!(catalog.len(), QueueKind::ALL.len());
        assert!(catalog.iter().any(|q| q.kind == QueueKind::Quality
            && q.full_name == "studio.studio_vhost.main.quality"));

        // Refresh fired exactly once.
        assert!(refresh_rx.has_changed().unwrap());
        refresh_rx.borrow_and_update();
        assert!(!refresh_rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn unknown_tenant_rejected() {
        let (_, _, provisioner) = fixture();
        let err = provisioner
            .issue_token(&TenantId::from("ghost"), &ProductId::from("7"), "main")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownTenant(_)));
    }

    #[tokio::test]
    async fn invalid_logical_name_touches_nothing() {
        let (broker, store, provisioner) = fixture();
        let id = tenant(&provisioner).await;

        let err = provisioner
            .issue_token(&id, &ProductId::from("7"), "bad.name")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Invalid(_)));
        assert!(store.list_queues().await.unwrap().is_empty());
        assert_eq!(broker.depth("studio.studio_vhost.bad.name.quality"), 0);
    }

    #[tokio::test]
    async fn store_conflict_rolls_back_broker_queues() {
        let (broker, store, provisioner) = fixture();
        let id = tenant(&provisioner).await;

        // Pre-seed a colliding catalog record so insert_queue fails
        // mid-flight.
        store
            .insert_queue(&QueueRecord {
                full_name: "studio.studio_vhost.main.start_session".into(),
                logical_name: "main".into(),
                kind: QueueKind::StartSession,
                token: TokenValue::from("other"),
                vhost: VhostId::from("studio_vhost"),
            })
            .await
            .unwrap();

        let err = provisioner
            .issue_token(&id, &ProductId::from("7"), "main")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Store(_)));

        // Broker side cleaned up: publishing to any of the would-be queues
        // fails, and the half-issued token is gone too.
        let publish = broker.publish("studio.studio_vhost.main.quality", b"x".to_vec());
        assert!(matches!(publish, Err(BrokerError::NotFound(_))));
        let catalog = store.list_queues().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].token.as_str(), "other");
    }

    #[tokio::test]
    async fn retire_token_clears_broker_and_catalog() {
        let (broker, store, provisioner) = fixture();
        let id = tenant(&provisioner).await;
        let grant = provisioner
            .issue_token(&id, &ProductId::from("7"), "main")
            .await
            .unwrap();

        provisioner.retire_token(&grant.token).await.unwrap();

        assert!(store.list_queues().await.unwrap().is_empty());
        let publish = broker.publish(&grant.queues[0].full_name, b"x".to_vec());
        assert!(matches!(publish, Err(BrokerError::NotFound(_))));

        // Retiring again is a no-op, not an error.
        provisioner.retire_token(&grant.token).await.unwrap();
    }
}
