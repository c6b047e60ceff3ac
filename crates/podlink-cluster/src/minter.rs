//! Transactional minting and best-effort revocation of scoped credentials

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::MintError;
use crate::principal::PrincipalApi;
use podlink_common::{PrincipalHandle, ScopedCredential, WorkloadLocation};

/// Mints and revokes credentials scoped to a single workload
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait ClusterCredentialIssuer: Send + Sync {
    /// Create a principal bound to `workload` and issue it a bearer token
    ///
    /// On error no principal or binding created by this call remains.
    async fn mint(&self, workload: &WorkloadLocation) -> Result<ScopedCredential, MintError>;

    /// Delete the binding and the principal behind `credential`
    ///
    /// Never fails: both deletions are attempted and errors are logged.
    /// Revoking an already-revoked credential is a no-op.
    async fn revoke(&self, credential: &ScopedCredential);
}

/// Minting parameters
#[derive(Clone, Debug)]
pub struct MinterConfig {
    /// Prefix for generated principal names
    pub name_prefix: String,
    /// Lifetime of issued bearer tokens
    pub token_ttl: Duration,
}

impl Default for MinterConfig {
    fn default() -> Self {
        Self {
            name_prefix: "podlink-session".to_string(),
            token_ttl: Duration::from_secs(3600),
        }
    }
}

/// [`ClusterCredentialIssuer`] that drives a [`PrincipalApi`] step by step
pub struct ScopedMinter<A> {
    api: A,
    config: MinterConfig,
}

impl<A: PrincipalApi> ScopedMinter<A> {
    /// Create a minter over `api`
    pub fn new(api: A, config: MinterConfig) -> Self {
        Self { api, config }
    }

    fn principal_name(&self) -> String {
        format!("{}-{}", self.config.name_prefix, Uuid::new_v4().simple())
    }

    /// Undo a partial mint. The binding goes first so the principal never
    /// outlives a reference to it.
    async fn rollback(&self, handle: &PrincipalHandle, binding_created: bool) {
        if binding_created {
            if let Err(e) = self
                .api
                .delete_binding(&handle.namespace, &handle.binding)
                .await
            {
                warn!(
                    namespace = %handle.namespace,
                    binding = %handle.binding,
                    error = %e,
                    "Failed to roll back binding"
                );
            }
        }
        if let Err(e) = self
            .api
            .delete_principal(&handle.namespace, &handle.principal)
            .await
        {
            warn!(
                namespace = %handle.namespace,
                principal = %handle.principal,
                error = %e,
                "Failed to roll back principal"
            );
        }
    }
}

#[async_trait]
impl<A: PrincipalApi> ClusterCredentialIssuer for ScopedMinter<A> {
    #[instrument(skip(self), fields(workload = %workload.name, namespace = %workload.namespace))]
    async fn mint(&self, workload: &WorkloadLocation) -> Result<ScopedCredential, MintError> {
        let ttl_secs = i64::try_from(self.config.token_ttl.as_secs()).map_err(|_| {
            MintError::TokenMintFailed(format!(
                "token ttl of {}s is out of range",
                self.config.token_ttl.as_secs()
            ))
        })?;

        let principal = self.principal_name();
        let handle = PrincipalHandle {
            namespace: workload.namespace.clone(),
            binding: format!("{}-binding", principal),
            principal,
        };

        self.api
            .create_principal(&handle.namespace, &handle.principal, &workload.name)
            .await
            .map_err(|e| MintError::PrincipalCreateFailed(e.to_string()))?;

        let role = match self.api.ensure_role(&handle.namespace, &workload.name).await {
            Ok(role) => role,
            Err(e) => {
                self.rollback(&handle, false).await;
                return Err(MintError::BindingFailed(e.to_string()));
            }
        };

        // A failed create may still have landed server-side, so the rollback
        // deletes the binding regardless.
        if let Err(e) = self
            .api
            .create_binding(&handle.namespace, &handle.binding, &handle.principal, &role)
            .await
        {
            self.rollback(&handle, true).await;
            return Err(MintError::BindingFailed(e.to_string()));
        }

        let bearer = match self
            .api
            .request_token(&handle.namespace, &handle.principal, ttl_secs)
            .await
        {
            Ok(bearer) => bearer,
            Err(e) => {
                self.rollback(&handle, true).await;
                return Err(MintError::TokenMintFailed(e.to_string()));
            }
        };

        // The API server may cap the requested lifetime
        let expires_at = bearer.expires_at;
        info!(principal = %handle.principal, %expires_at, "Minted scoped credential");

        Ok(ScopedCredential::new(handle, bearer.token.to_string(), expires_at))
    }

    #[instrument(skip(self, credential), fields(principal = %credential.handle().principal))]
    async fn revoke(&self, credential: &ScopedCredential) {
        let handle = credential.handle();

        if let Err(e) = self
            .api
            .delete_binding(&handle.namespace, &handle.binding)
            .await
        {
            warn!(binding = %handle.binding, error = %e, "Failed to delete binding");
        }
        if let Err(e) = self
            .api
            .delete_principal(&handle.namespace, &handle.principal)
            .await
        {
            warn!(error = %e, "Failed to delete principal");
        }

        info!("Revoked scoped credential");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::Utc;
    use parking_lot::Mutex;
    use podlink_common::WorkloadStatus;
    use zeroize::Zeroizing;

    use crate::error::ClusterApiError;
    use crate::principal::{IssuedBearer, MockPrincipalApi};

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    enum Step {
        Principal,
        Role,
        Binding,
        Token,
    }

    /// In-memory cluster that can fail one chosen step
    #[derive(Default)]
    struct FakeCluster {
        principals: Mutex<HashSet<(String, String)>>,
        bindings: Mutex<HashSet<(String, String)>>,
        fail_at: Mutex<Option<Step>>,
        fail_deletes: Mutex<bool>,
    }

    impl FakeCluster {
        fn failing_at(step: Step) -> Arc<Self> {
            let fake = Arc::new(Self::default());
            *fake.fail_at.lock() = Some(step);
            fake
        }

        fn check(&self, step: Step) -> Result<(), ClusterApiError> {
            if *self.fail_at.lock() == Some(step) {
                return Err(ClusterApiError(format!("injected failure at {:?}", step)));
            }
            Ok(())
        }

        fn principal_count(&self) -> usize {
            self.principals.lock().len()
        }

        fn binding_count(&self) -> usize {
            self.bindings.lock().len()
        }
    }

    #[async_trait]
    impl PrincipalApi for Arc<FakeCluster> {
        async fn create_principal(
            &self,
            namespace: &str,
            name: &str,
            _workload: &str,
        ) -> Result<(), ClusterApiError> {
            self.check(Step::Principal)?;
            self.principals
                .lock()
                .insert((namespace.to_string(), name.to_string()));
            Ok(())
        }

        async fn ensure_role(
            &self,
            _namespace: &str,
            workload: &str,
        ) -> Result<String, ClusterApiError> {
            self.check(Step::Role)?;
            Ok(crate::principal::role_name(workload))
        }

        async fn create_binding(
            &self,
            namespace: &str,
            binding: &str,
            _principal: &str,
            _role: &str,
        ) -> Result<(), ClusterApiError> {
            self.check(Step::Binding)?;
            self.bindings
                .lock()
                .insert((namespace.to_string(), binding.to_string()));
            Ok(())
        }

        async fn request_token(
            &self,
            _namespace: &str,
            principal: &str,
            ttl_secs: i64,
        ) -> Result<IssuedBearer, ClusterApiError> {
            self.check(Step::Token)?;
            Ok(IssuedBearer {
                token: Zeroizing::new(format!("token-for-{}", principal)),
                expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
            })
        }

        async fn delete_binding(
            &self,
            namespace: &str,
            binding: &str,
        ) -> Result<(), ClusterApiError> {
            if *self.fail_deletes.lock() {
                return Err(ClusterApiError("delete refused".into()));
            }
            self.bindings
                .lock()
                .remove(&(namespace.to_string(), binding.to_string()));
            Ok(())
        }

        async fn delete_principal(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<(), ClusterApiError> {
            if *self.fail_deletes.lock() {
                return Err(ClusterApiError("delete refused".into()));
            }
            self.principals
                .lock()
                .remove(&(namespace.to_string(), name.to_string()));
            Ok(())
        }
    }

    fn workload() -> WorkloadLocation {
        WorkloadLocation {
            name: "nb-alice".into(),
            namespace: "user-alice".into(),
            status: WorkloadStatus::Running,
        }
    }

    #[tokio::test]
    async fn mint_creates_principal_binding_and_token() {
        let cluster = Arc::new(FakeCluster::default());
        let minter = ScopedMinter::new(cluster.clone(), MinterConfig::default());

        let cred = minter.mint(&workload()).await.unwrap();

        assert_eq!(cluster.principal_count(), 1);
        assert_eq!(cluster.binding_count(), 1);
        assert_eq!(cred.handle().namespace, "user-alice");
        assert!(cred.handle().principal.starts_with("podlink-session-"));
        assert_eq!(
            cred.bearer_token(),
            format!("token-for-{}", cred.handle().principal)
        );
        assert!(cred.expires_at() > Utc::now());
    }

    #[tokio::test]
    async fn each_mint_gets_a_distinct_principal() {
        let cluster = Arc::new(FakeCluster::default());
        let minter = ScopedMinter::new(cluster.clone(), MinterConfig::default());

        let a = minter.mint(&workload()).await.unwrap();
        let b = minter.mint(&workload()).await.unwrap();

        assert_ne!(a.handle().principal, b.handle().principal);
        assert_eq!(cluster.principal_count(), 2);
    }

    /// Given a cluster that fails one step of the mint sequence
    /// When a credential is minted
    /// Then the matching error is returned and nothing is left behind
    #[tokio::test]
    async fn failed_mint_leaves_no_orphans() {
        let cases = [
            (Step::Principal, "PrincipalCreateFailed"),
            (Step::Role, "BindingFailed"),
            (Step::Binding, "BindingFailed"),
            (Step::Token, "TokenMintFailed"),
        ];

        for (step, expected) in cases {
            let cluster = FakeCluster::failing_at(step);
            let minter = ScopedMinter::new(cluster.clone(), MinterConfig::default());

            let err = minter.mint(&workload()).await.unwrap_err();
            let variant = match err {
                MintError::PrincipalCreateFailed(_) => "PrincipalCreateFailed",
                MintError::BindingFailed(_) => "BindingFailed",
                MintError::TokenMintFailed(_) => "TokenMintFailed",
            };

            assert_eq!(variant, expected, "step {:?}", step);
            assert_eq!(cluster.principal_count(), 0, "orphaned principal at {:?}", step);
            assert_eq!(cluster.binding_count(), 0, "orphaned binding at {:?}", step);
        }
    }

    #[tokio::test]
    async fn revoke_removes_binding_and_principal() {
        let cluster = Arc::new(FakeCluster::default());
        let minter = ScopedMinter::new(cluster.clone(), MinterConfig::default());

        let cred = minter.mint(&workload()).await.unwrap();
        minter.revoke(&cred).await;

        assert_eq!(cluster.principal_count(), 0);
        assert_eq!(cluster.binding_count(), 0);
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let cluster = Arc::new(FakeCluster::default());
        let minter = ScopedMinter::new(cluster.clone(), MinterConfig::default());

        let cred = minter.mint(&workload()).await.unwrap();
        minter.revoke(&cred).await;
        minter.revoke(&cred).await;

        assert_eq!(cluster.principal_count(), 0);
    }

    #[tokio::test]
    async fn revoke_swallows_delete_errors() {
        let cluster = Arc::new(FakeCluster::default());
        let minter = ScopedMinter::new(cluster.clone(), MinterConfig::default());

        let cred = minter.mint(&workload()).await.unwrap();
        *cluster.fail_deletes.lock() = true;
        minter.revoke(&cred).await;

        // Still present, but revoke returned normally
        assert_eq!(cluster.principal_count(), 1);
    }

    #[tokio::test]
    async fn revoke_attempts_principal_even_when_binding_delete_fails() {
        let mut api = MockPrincipalApi::new();
        api.expect_delete_binding()
            .times(1)
            .returning(|_, _| Err(ClusterApiError("forbidden".into())));
        api.expect_delete_principal()
            .times(1)
            .returning(|_, _| Ok(()));

        let minter = ScopedMinter::new(api, MinterConfig::default());
        let cred = ScopedCredential::new(
            PrincipalHandle {
                namespace: "user-alice".into(),
                principal: "podlink-session-x".into(),
                binding: "podlink-session-x-binding".into(),
            },
            "t".into(),
            Utc::now(),
        );

        minter.revoke(&cred).await;
    }

    #[tokio::test]
    async fn token_ttl_is_passed_to_the_cluster() {
        let mut api = MockPrincipalApi::new();
        api.expect_create_principal().returning(|_, _, _| Ok(()));
        api.expect_ensure_role()
            .returning(|_, w| Ok(crate::principal::role_name(w)));
        api.expect_create_binding()
            .withf(|_, _, _, role| role.ends_with("podlink-workload-nb-alice"))
            .returning(|_, _, _, _| Ok(()));
        api.expect_request_token()
            .withf(|_, _, ttl| *ttl == 900)
            .times(1)
            .returning(|_, _, ttl| {
                Ok(IssuedBearer {
                    token: Zeroizing::new("tok".into()),
                    expires_at: Utc::now() + chrono::Duration::seconds(ttl),
                })
            });

        let minter = ScopedMinter::new(
            api,
            MinterConfig {
                token_ttl: Duration::from_secs(900),
                ..Default::default()
            },
        );

        let cred = minter.mint(&workload()).await.unwrap();
        let remaining = cred.expires_at() - Utc::now();
        assert!(remaining <= chrono::Duration::seconds(900));
        assert!(remaining > chrono::Duration::seconds(890));
    }

    #[tokio::test]
    async fn expiry_comes_from_the_api_server() {
        let capped = Utc::now() + chrono::Duration::seconds(600);
        let mut api = MockPrincipalApi::new();
        api.expect_create_principal().returning(|_, _, _| Ok(()));
        api.expect_ensure_role()
            .returning(|_, w| Ok(crate::principal::role_name(w)));
        api.expect_create_binding().returning(|_, _, _, _| Ok(()));
        api.expect_request_token()
            .withf(|_, _, ttl| *ttl == 3600)
            .returning(move |_, _, _| {
                Ok(IssuedBearer {
                    token: Zeroizing::new("tok".into()),
                    expires_at: capped,
                })
            });

        let minter = ScopedMinter::new(api, MinterConfig::default());
        let cred = minter.mint(&workload()).await.unwrap();

        assert_eq!(cred.expires_at(), capped);
    }

    #[tokio::test]
    async fn out_of_range_ttl_fails_before_creating_anything() {
        let mut api = MockPrincipalApi::new();
        api.expect_create_principal().never();
        api.expect_request_token().never();

        let minter = ScopedMinter::new(
            api,
            MinterConfig {
                token_ttl: Duration::from_secs(u64::MAX),
                ..Default::default()
            },
        );

        let err = minter.mint(&workload()).await.unwrap_err();
        assert!(matches!(err, MintError::TokenMintFailed(_)));
    }
}
