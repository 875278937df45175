//! In-process broker implementing both Telemetra broker capabilities.
//!
//! Queues are bounded only by memory; each is a `VecDeque` guarded by a
//! mutex plus a [`Notify`] for waiters. Nack requeues at the front with an
//! incremented attempt counter, so redelivery preserves queue order exactly
//! like a single-consumer AMQP channel. Used as the test fixture everywhere
//! and as a standalone single-process deployment mode.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::sync::Notify;

use telemetra_broker::{
    AccountCredentials, Acknowledger, BrokerAdmin, BrokerError, Delivery, MessageSource,
};
use telemetra_core::{TenantId, VhostId};

/// Password length for minted principals, matching the management backend.
const PASSWORD_LEN: usize = 64;

#[derive(Debug)]
struct Stored {
    body: Vec<u8>,
    attempts: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Mutex<VecDeque<Stored>>,
    notify: Notify,
}

impl QueueState {
    fn push_back(&self, stored: Stored) {
        self.messages
            .lock()
            .expect("queue mutex poisoned")
            .push_back(stored);
        self.notify.notify_one();
    }

    fn push_front(&self, stored: Stored) {
        self.messages
            .lock()
            .expect("queue mutex poisoned")
            .push_front(stored);
        self.notify.notify_one();
    }

    fn pop_front(&self) -> Option<Stored> {
        self.messages
            .lock()
            .expect("queue mutex poisoned")
            .pop_front()
    }
}

/// In-memory broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    accounts: Arc<DashMap<String, String>>,
    vhosts: Arc<DashMap<String, ()>>,
    queues: Arc<DashMap<String, Arc<QueueState>>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message body onto a queue, as an SDK client would.
    ///
    /// Fails with [`BrokerError::NotFound`] if the queue was never declared.
    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        let state = self
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue {queue}")))?;
        state.push_back(Stored {
            body: body.into(),
            attempts: 0,
        });
        Ok(())
    }

    /// Number of messages currently sitting in a queue (tests only).
    #[must_use]
    pub fn depth(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|s| s.messages.lock().expect("queue mutex poisoned").len())
            .unwrap_or(0)
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
impl BrokerAdmin for MemoryBroker {
    async fn account_exists(&self, username: &str) -> Result<bool, BrokerError> {
        Ok(self.accounts.contains_key(username))
    }

    async fn create_account(&self, tenant: &TenantId) -> Result<AccountCredentials, BrokerError> {
        let username = tenant.to_string();
        if self.accounts.contains_key(&username) {
            return Err(BrokerError::AlreadyExists(username));
        }
        let password = Self::mint_password();
        self.accounts.insert(username.clone(), password.clone());
        Ok(AccountCredentials { username, password })
    }

    async fn delete_account(&self, username: &str) -> Result<(), BrokerError> {
        self.accounts
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("account {username}")))
    }

    async fn create_vhost(&self, tenant: &TenantId) -> Result<VhostId, BrokerError> {
        let vhost = VhostId::from(format!("{tenant}_vhost"));
        self.vhosts.insert(vhost.to_string(), ());
        Ok(vhost)
    }

    async fn delete_vhost(&self, vhost: &VhostId) -> Result<(), BrokerError> {
        self.vhosts
            .remove(vhost.as_str())
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("vhost {vhost}")))
    }

    async fn create_queue(&self, vhost: &VhostId, full_name: &str) -> Result<(), BrokerError> {
        if !self.vhosts.contains_key(vhost.as_str()) {
            return Err(BrokerError::NotFound(format!("vhost {vhost}")));
        }
        // Declare-if-exists is success, mirroring the management API contract.
        self.queues
            .entry(full_name.to_owned())
            .or_insert_with(|| Arc::new(QueueState::default()));
        Ok(())
    }

    async fn delete_queue(&self, _vhost: &VhostId, full_name: &str) -> Result<(), BrokerError> {
        self.queues
            .remove(full_name)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("queue {full_name}")))
    }
}

struct MemoryAcker {
    queue: Arc<QueueState>,
    body: Vec<u8>,
    attempts: u32,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        // The message was popped on receive; ack is final.
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), BrokerError> {
        self.queue.push_front(Stored {
            body: self.body,
            attempts: self.attempts + 1,
        });
        Ok(())
    }
}

#[async_trait]
impl MessageSource for MemoryBroker {
    async fn receive(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let state = self
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue {queue}")))?
            .clone();

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(stored) = state.pop_front() {
                let acker = MemoryAcker {
                    queue: Arc::clone(&state),
                    body: stored.body.clone(),
                    attempts: stored.attempts,
                };
                return Ok(Some(Delivery::new(
                    queue.to_owned(),
                    stored.body,
                    stored.attempts,
                    Box::new(acker),
                )));
            }
            if tokio::time::timeout_at(deadline, state.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    async fn broker_with_queue(name: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        let vhost = broker
            .create_vhost(&TenantId::from("studio"))
            .await
            .unwrap();
        broker.create_queue(&vhost, name).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn publish_receive_ack() {
        let broker = broker_with_queue("q1").await;
        broker.publish("q1", b"hello".to_vec()).unwrap();

        let delivery = broker.receive("q1", WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.body, b"hello");
        assert_eq!(delivery.attempts, 0);
        delivery.ack().await.unwrap();
        assert_eq!(broker.depth("q1"), 0);
    }

    #[tokio::test]
    async fn nack_requeues_front_with_attempt_count() {
        let broker = broker_with_queue("q1").await;
        broker.publish("q1", b"first".to_vec()).unwrap();
        broker.publish("q1", b"second".to_vec()).unwrap();

        let d = broker.receive("q1", WAIT).await.unwrap().unwrap();
        assert_eq!(d.body, b"first");
        d.nack().await.unwrap();

        // Redelivered ahead of "second", with the counter bumped.
        let d = broker.receive("q1", WAIT).await.unwrap().unwrap();
        assert_eq!(d.body, b"first");
        assert_eq!(d.attempts, 1);
        d.ack().await.unwrap();

        let d = broker.receive("q1", WAIT).await.unwrap().unwrap();
        assert_eq!(d.body, b"second");
    }

    #[tokio::test]
    async fn receive_times_out_on_empty_queue() {
        let broker = broker_with_queue("q1").await;
        let got = broker.receive("q1", Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn receive_unknown_queue_fails() {
        let broker = MemoryBroker::new();
        let err = broker.receive("ghost", WAIT).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn account_creation_is_fatal_on_existing_principal() {
        let broker = MemoryBroker::new();
        let tenant = TenantId::from("studio");
        let creds = broker.create_account(&tenant).await.unwrap();
        assert_eq!(creds.username, "studio");
        assert_eq!(creds.password.len(), PASSWORD_LEN);

        let err = broker.create_account(&tenant).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn queue_declare_is_idempotent() {
        let broker = MemoryBroker::new();
        let vhost = broker
            .create_vhost(&TenantId::from("studio"))
            .await
            .unwrap();
        assert_eq!(vhost.as_str(), "studio_vhost");
        broker.create_queue(&vhost, "a.b.c.quality").await.unwrap();
        broker.create_queue(&vhost, "a.b.c.quality").await.unwrap();

        // Existing contents survive a re-declare.
        broker.publish("a.b.c.quality", b"x".to_vec()).unwrap();
        broker.create_queue(&vhost, "a.b.c.quality").await.unwrap();
        assert_eq!(broker.depth("a.b.c.quality"), 1);
    }

    #[tokio::test]
    async fn delete_missing_vhost_and_queue() {
        let broker = MemoryBroker::new();
        let err = broker
            .delete_vhost(&VhostId::from("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
        let err = broker
            .delete_queue(&VhostId::from("ghost"), "q")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn receive_wakes_on_publish() {
        let broker = broker_with_queue("q1").await;
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive("q1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish("q1", b"late".to_vec()).unwrap();
        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.body, b"late");
    }
}
