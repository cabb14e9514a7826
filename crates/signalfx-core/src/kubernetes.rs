// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the Kubernetes monitors: API client construction for the
//! supported auth modes and cluster reporter election.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::errors::ConfigError;

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
pub const POD_NAME_ENV: &str = "MY_POD_NAME";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KubeAuth {
    None,
    Tls,
    #[default]
    ServiceAccount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesApiConfig {
    #[serde(default)]
    pub auth_type: KubeAuth,
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

impl KubernetesApiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_type == KubeAuth::Tls
            && (self.client_cert_path.is_none() || self.client_key_path.is_none())
        {
            return Err(ConfigError::invalid(
                "authType",
                "tls auth requires clientCertPath and clientKeyPath",
            ));
        }
        Ok(())
    }

    pub fn build_client(&self, timeout: Duration) -> Result<reqwest::Client, ConfigError> {
        self.build_client_with_sa_dir(timeout, Path::new(SERVICE_ACCOUNT_DIR))
    }

    pub fn build_client_with_sa_dir(
        &self,
        timeout: Duration,
        service_account_dir: &Path,
    ) -> Result<reqwest::Client, ConfigError> {
        self.validate()?;
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .danger_accept_invalid_certs(self.skip_verify);

        if let Some(ca) = &self.ca_cert_path {
            builder = builder.add_root_certificate(read_certificate(ca)?);
        }

        match self.auth_type {
            KubeAuth::None => {}
            KubeAuth::Tls => {
                if let (Some(cert), Some(key)) = (&self.client_cert_path, &self.client_key_path) {
                    let mut pem = std::fs::read(cert)?;
                    pem.push(b'\n');
                    pem.extend(std::fs::read(key)?);
                    let identity = reqwest::Identity::from_pem(&pem)
                        .map_err(|e| ConfigError::invalid("clientCertPath", e.to_string()))?;
                    builder = builder.identity(identity);
                }
            }
            KubeAuth::ServiceAccount => {
                let token = std::fs::read_to_string(service_account_dir.join("token"))?;
                let mut headers = HeaderMap::new();
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                    .map_err(|e| ConfigError::invalid("serviceAccount token", e.to_string()))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
                builder = builder.default_headers(headers);

                if self.ca_cert_path.is_none() {
                    let ca = service_account_dir.join("ca.crt");
                    builder = builder.add_root_certificate(read_certificate(&ca)?);
                }
            }
        }

        builder
            .build()
            .map_err(|e| ConfigError::invalid("kubernetesAPI", e.to_string()))
    }
}

fn read_certificate(path: &Path) -> Result<reqwest::Certificate, ConfigError> {
    let pem = std::fs::read(path)?;
    reqwest::Certificate::from_pem(&pem)
        .map_err(|e| ConfigError::invalid(path.display().to_string(), e.to_string()))
}

/// The in-cluster API server URL from the standard service env vars.
pub fn api_url_from_env() -> Option<String> {
    let host = env::var("KUBERNETES_SERVICE_HOST").ok()?;
    let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
    if host.contains(':') {
        Some(format!("https://[{host}]:{port}"))
    } else {
        Some(format!("https://{host}:{port}"))
    }
}

/// Reads this agent's pod name. Only optional when this agent always reports.
pub fn pod_name_from_env(always_cluster_reporter: bool) -> Result<Option<String>, ConfigError> {
    match env::var(POD_NAME_ENV) {
        Ok(name) if !name.is_empty() => Ok(Some(name)),
        _ if always_cluster_reporter => Ok(None),
        _ => Err(ConfigError::MissingField(POD_NAME_ENV.to_string())),
    }
}

/// Exactly one agent in the cluster reports cluster-wide metrics: the one
/// whose pod name sorts first among the running agent pods.
pub fn is_reporter(
    my_pod_name: Option<&str>,
    agent_pod_names: &[String],
    always_cluster_reporter: bool,
) -> bool {
    if always_cluster_reporter {
        return true;
    }
    let Some(me) = my_pod_name else {
        return false;
    };
    let leader = agent_pod_names.iter().min();
    debug!("Cluster reporter election: leader={leader:?}, me={me}");
    leader.is_some_and(|l| l == me)
}
