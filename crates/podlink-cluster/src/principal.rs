//! Cluster API calls behind credential minting
//!
//! [`PrincipalApi`] is the narrow seam the minter drives. Each method is one
//! cluster call, so tests can inject a failure at any step of the mint
//! sequence without a real API server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::ClusterApiError;
use crate::{FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_WORKLOAD, MANAGED_BY_PODLINK};

/// Prefix of the per-workload permission object
const ROLE_PREFIX: &str = "podlink-workload-";

/// Bearer token issued for a principal
pub struct IssuedBearer {
    /// Token value
    pub token: Zeroizing<String>,
    /// Expiry as reported by the API server, which may cap the requested lifetime
    pub expires_at: DateTime<Utc>,
}

/// One cluster call per method
///
/// Deletes treat an already-missing object as success.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait PrincipalApi: Send + Sync {
    /// Create a service account labelled with the workload it serves
    async fn create_principal(
        &self,
        namespace: &str,
        name: &str,
        workload: &str,
    ) -> Result<(), ClusterApiError>;

    /// Apply the permission object for `workload` and return its name
    async fn ensure_role(&self, namespace: &str, workload: &str) -> Result<String, ClusterApiError>;

    /// Bind `principal` to `role`
    async fn create_binding(
        &self,
        namespace: &str,
        binding: &str,
        principal: &str,
        role: &str,
    ) -> Result<(), ClusterApiError>;

    /// Issue a bearer token for `principal`, asking for `ttl_secs` of validity
    async fn request_token(
        &self,
        namespace: &str,
        principal: &str,
        ttl_secs: i64,
    ) -> Result<IssuedBearer, ClusterApiError>;

    /// Delete a binding
    async fn delete_binding(&self, namespace: &str, binding: &str) -> Result<(), ClusterApiError>;

    /// Delete a service account
    async fn delete_principal(&self, namespace: &str, name: &str)
        -> Result<(), ClusterApiError>;
}

/// Name of the permission object scoped to `workload`
pub fn role_name(workload: &str) -> String {
    format!("{}{}", ROLE_PREFIX, workload)
}

/// Permission object granting access to exactly one pod
///
/// Reading the pod itself plus the exec, port-forward and log
/// subresources, all restricted to the pod's name. Nothing else in the
/// namespace is reachable with a token bound to this role.
pub fn workload_role(namespace: &str, workload: &str) -> Role {
    let only_this_pod = Some(vec![workload.to_string()]);
    Role {
        metadata: ObjectMeta {
            name: Some(role_name(workload)),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels(workload)),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string()]),
                resource_names: only_this_pod.clone(),
                verbs: vec!["get".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec![
                    "pods/exec".to_string(),
                    "pods/portforward".to_string(),
                    "pods/log".to_string(),
                ]),
                resource_names: only_this_pod,
                verbs: vec!["create".to_string(), "get".to_string()],
                ..Default::default()
            },
        ]),
    }
}

fn managed_labels(workload: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_PODLINK.to_string()),
        (LABEL_WORKLOAD.to_string(), workload.to_string()),
    ])
}

fn ignore_not_found(result: Result<(), kube::Error>) -> Result<(), ClusterApiError> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// [`PrincipalApi`] backed by the broker's own cluster client
#[derive(Clone)]
pub struct KubePrincipalApi {
    client: Client,
}

impl KubePrincipalApi {
    /// Wrap a client whose identity may manage service accounts and RBAC
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PrincipalApi for KubePrincipalApi {
    async fn create_principal(
        &self,
        namespace: &str,
        name: &str,
        workload: &str,
    ) -> Result<(), ClusterApiError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(managed_labels(workload)),
                ..Default::default()
            },
            automount_service_account_token: Some(false),
            ..Default::default()
        };
        api.create(&PostParams::default(), &sa).await?;
        debug!(namespace = %namespace, principal = %name, "Created service account");
        Ok(())
    }

    async fn ensure_role(&self, namespace: &str, workload: &str) -> Result<String, ClusterApiError> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        let role = workload_role(namespace, workload);
        let name = role_name(workload);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&role),
        )
        .await?;
        debug!(namespace = %namespace, role = %name, "Applied workload role");
        Ok(name)
    }

    async fn create_binding(
        &self,
        namespace: &str,
        binding: &str,
        principal: &str,
        role: &str,
    ) -> Result<(), ClusterApiError> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let rb = RoleBinding {
            metadata: ObjectMeta {
                name: Some(binding.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    LABEL_MANAGED_BY.to_string(),
                    MANAGED_BY_PODLINK.to_string(),
                )])),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: role.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: principal.to_string(),
                namespace: Some(namespace.to_string()),
                api_group: None,
            }]),
        };
        api.create(&PostParams::default(), &rb).await?;
        debug!(namespace = %namespace, binding = %binding, "Created role binding");
        Ok(())
    }

    async fn request_token(
        &self,
        namespace: &str,
        principal: &str,
        ttl_secs: i64,
    ) -> Result<IssuedBearer, ClusterApiError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let request = TokenRequest {
            metadata: Default::default(),
            spec: TokenRequestSpec {
                audiences: vec![],
                expiration_seconds: Some(ttl_secs),
                bound_object_ref: None,
            },
            status: None,
        };

        let response = api
            .create_token_request(principal, &PostParams::default(), &request)
            .await?;

        response
            .status
            .map(|s| IssuedBearer {
                token: Zeroizing::new(s.token),
                expires_at: s.expiration_timestamp.0,
            })
            .ok_or_else(|| ClusterApiError("token request returned no status".to_string()))
    }

    async fn delete_binding(&self, namespace: &str, binding: &str) -> Result<(), ClusterApiError> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(
            api.delete(binding, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn delete_principal(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterApiError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }
}
