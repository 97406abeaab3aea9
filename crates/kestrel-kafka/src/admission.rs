//! Admission control: authorization and quota checks applied before a
//! request is handed to its handler.
//!
//! Both subsystems sit behind async ports injected at construction, so the
//! connection loop never reaches into globals. Authorization runs first and
//! only for descriptors that require it; the quota check runs for every
//! dispatched request. A quota verdict may carry a throttle delay, which the
//! connection applies before admitting the *next* frame, never to the request
//! already in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::dispatch::ApiDescriptor;
use crate::error::ErrorCode;
use crate::sasl::Principal;

/// Operation implied by a request, used for authorization checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Create,
    Delete,
    Describe,
    ClusterAction,
}

/// Resource a request operates on. The connection engine authorizes at
/// cluster scope; handlers that know their decoded payload may run finer
/// checks against topics or groups through the same port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Cluster,
    Topic(String),
    Group(String),
}

/// Authorization verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

/// Authorization subsystem contract.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        principal: &Principal,
        operation: Operation,
        resource: &Resource,
    ) -> Decision;
}

/// Authorizer that allows everything. The default when no ACL subsystem is
/// wired up, matching broker behavior with authorization disabled.
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(
        &self,
        _principal: &Principal,
        _operation: Operation,
        _resource: &Resource,
    ) -> Decision {
        Decision::Allowed
    }
}

/// Coarse request cost class fed into the quota backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCategory {
    /// Control-plane style requests: metadata, group management.
    Light,
    /// Data-path requests: produce, fetch.
    Heavy,
}

/// Verdict from the quota subsystem for one request.
///
/// Whether an exhausted budget delays or rejects is backend policy; the
/// engine honors either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaVerdict {
    /// Run the request. A non-zero throttle postpones admission of the next
    /// frame from this connection.
    Admit { throttle: Duration },
    /// Refuse the request with a per-request error response.
    Reject { error: ErrorCode },
}

/// Quota subsystem contract, keyed by client id.
#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// A connection started using this client id.
    fn connected(&self, client_id: &str);

    /// A connection using this client id went away. Paired with exactly one
    /// earlier `connected` call.
    fn disconnected(&self, client_id: &str);

    /// Record one request against the client's budget and return a verdict.
    async fn record(
        &self,
        client_id: Option<&str>,
        request_bytes: usize,
        category: RequestCategory,
    ) -> QuotaVerdict;
}

/// Quota gate that admits everything with no throttle.
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaGate for UnlimitedQuota {
    fn connected(&self, _client_id: &str) {}

    fn disconnected(&self, _client_id: &str) {}

    async fn record(
        &self,
        _client_id: Option<&str>,
        _request_bytes: usize,
        _category: RequestCategory,
    ) -> QuotaVerdict {
        QuotaVerdict::Admit {
            throttle: Duration::ZERO,
        }
    }
}

/// Outcome of admission control for one request.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Execute the request; apply `throttle` before admitting the next frame.
    Granted { throttle: Duration },
    /// Do not execute; answer with this error code instead.
    Rejected { error: ErrorCode },
}

/// Runs the authorization and quota checks in order for one request.
pub struct AdmissionController {
    authorizer: Arc<dyn Authorizer>,
    quota: Arc<dyn QuotaGate>,
}

impl AdmissionController {
    pub fn new(authorizer: Arc<dyn Authorizer>, quota: Arc<dyn QuotaGate>) -> Self {
        Self { authorizer, quota }
    }

    pub async fn admit(
        &self,
        descriptor: &ApiDescriptor,
        principal: Option<&Principal>,
        client_id: Option<&str>,
        request_bytes: usize,
    ) -> Admission {
        if descriptor.requires_authorization {
            let Some(principal) = principal else {
                debug!(api = descriptor.name, "authorization check with no principal");
                return Admission::Rejected {
                    error: authorization_error(&Resource::Cluster),
                };
            };
            let decision = self
                .authorizer
                .authorize(principal, descriptor.operation, &Resource::Cluster)
                .await;
            if decision == Decision::Denied {
                debug!(
                    api = descriptor.name,
                    principal = principal.name(),
                    "authorization denied"
                );
                return Admission::Rejected {
                    error: authorization_error(&Resource::Cluster),
                };
            }
        }

        match self
            .quota
            .record(client_id, request_bytes, descriptor.category)
            .await
        {
            QuotaVerdict::Admit { throttle } => Admission::Granted { throttle },
            QuotaVerdict::Reject { error } => {
                debug!(api = descriptor.name, ?client_id, "quota rejected request");
                Admission::Rejected { error }
            }
        }
    }
}

fn authorization_error(resource: &Resource) -> ErrorCode {
    match resource {
        Resource::Cluster => ErrorCode::ClusterAuthorizationFailed,
        Resource::Topic(_) => ErrorCode::TopicAuthorizationFailed,
        Resource::Group(_) => ErrorCode::GroupAuthorizationFailed,
    }
}

/// Tracks which client ids this connection registered with the quota
/// subsystem and releases each exactly once when the connection goes away,
/// whatever the exit path.
pub struct QuotaRegistration {
    quota: Arc<dyn QuotaGate>,
    clients: HashSet<String>,
}

impl QuotaRegistration {
    pub fn new(quota: Arc<dyn QuotaGate>) -> Self {
        Self {
            quota,
            clients: HashSet::new(),
        }
    }

    /// Register a client id on first sight.
    pub fn track(&mut self, client_id: &str) {
        if self.clients.insert(client_id.to_string()) {
            self.quota.connected(client_id);
        }
    }
}

impl Drop for QuotaRegistration {
    fn drop(&mut self) {
        for client_id in &self.clients {
            self.quota.disconnected(client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::dispatch::tests::descriptor_for_tests;

    struct DenyAll;

    #[async_trait]
    impl Authorizer for DenyAll {
        async fn authorize(
            &self,
            _principal: &Principal,
            _operation: Operation,
            _resource: &Resource,
        ) -> Decision {
            Decision::Denied
        }
    }

    #[derive(Default)]
    struct CountingQuota {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QuotaGate for CountingQuota {
        fn connected(&self, client_id: &str) {
            self.connected.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(client_id.to_string());
        }

        fn disconnected(&self, _client_id: &str) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        async fn record(
            &self,
            _client_id: Option<&str>,
            _request_bytes: usize,
            _category: RequestCategory,
        ) -> QuotaVerdict {
            QuotaVerdict::Admit {
                throttle: Duration::ZERO,
            }
        }
    }

    #[tokio::test]
    async fn allow_all_grants_with_no_throttle() {
        let controller =
            AdmissionController::new(Arc::new(AllowAllAuthorizer), Arc::new(UnlimitedQuota));
        let descriptor = descriptor_for_tests(3, true);
        let principal = Principal::anonymous();

        let admission = controller
            .admit(&descriptor, Some(&principal), Some("client"), 64)
            .await;
        assert_eq!(
            admission,
            Admission::Granted {
                throttle: Duration::ZERO
            }
        );
    }

    #[tokio::test]
    async fn denied_verdict_rejects_before_quota() {
        let controller = AdmissionController::new(Arc::new(DenyAll), Arc::new(UnlimitedQuota));
        let descriptor = descriptor_for_tests(0, true);
        let principal = Principal::new("bob");

        let admission = controller
            .admit(&descriptor, Some(&principal), None, 64)
            .await;
        assert_eq!(
            admission,
            Admission::Rejected {
                error: ErrorCode::ClusterAuthorizationFailed
            }
        );
    }

    #[tokio::test]
    async fn missing_principal_rejects_when_authorization_required() {
        let controller =
            AdmissionController::new(Arc::new(AllowAllAuthorizer), Arc::new(UnlimitedQuota));
        let descriptor = descriptor_for_tests(0, true);

        let admission = controller.admit(&descriptor, None, None, 16).await;
        assert!(matches!(admission, Admission::Rejected { .. }));
    }

    #[tokio::test]
    async fn no_authorization_check_when_not_required() {
        // DenyAll would reject if consulted; a descriptor without the flag
        // must bypass it.
        let controller = AdmissionController::new(Arc::new(DenyAll), Arc::new(UnlimitedQuota));
        let descriptor = descriptor_for_tests(18, false);

        let admission = controller.admit(&descriptor, None, None, 16).await;
        assert!(matches!(admission, Admission::Granted { .. }));
    }

    #[test]
    fn registration_released_exactly_once_per_client() {
        let quota = Arc::new(CountingQuota::default());
        {
            let mut registration = QuotaRegistration::new(quota.clone());
            registration.track("c1");
            registration.track("c1");
            registration.track("c2");
        }
        assert_eq!(quota.connected.load(Ordering::SeqCst), 2);
        assert_eq!(quota.disconnected.load(Ordering::SeqCst), 2);
        let seen = quota.seen.lock().unwrap();
        assert!(seen.contains(&"c1".to_string()));
        assert!(seen.contains(&"c2".to_string()));
    }
}
