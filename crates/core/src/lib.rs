use serde::{Serialize, Deserialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const SECRETS_AUTH_SCHEME: &str = "SECRETS";
pub const IAM_AUTH_DISABLED: &str = "DISABLED";

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("invalid input: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("auth[{index}]: secret_name must be set when auth_scheme is SECRETS")]
    MissingSecretName { index: usize },
    #[error("auth must contain at least one entry")]
    EmptyAuth,
}

fn default_auth_scheme() -> String { SECRETS_AUTH_SCHEME.to_string() }

/// One authentication method for client connections to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    #[serde(default)]
    pub client_password_auth_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub iam_auth: Option<String>,
    #[serde(default)]
    pub secret_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl AuthEntry {
    pub fn uses_secrets(&self) -> bool { self.auth_scheme == SECRETS_AUTH_SCHEME }

    // iam_auth is filled before secret_name is checked.
    fn normalize(&mut self, index: usize) -> Result<(), SchemaError> {
        if self.uses_secrets() && self.iam_auth.is_none() {
            self.iam_auth = Some(IAM_AUTH_DISABLED.to_string());
        }
        if self.uses_secrets() && self.secret_name.is_none() {
            return Err(SchemaError::MissingSecretName { index });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineFamily {
    Mysql,
    #[default]
    Postgresql,
}

impl EngineFamily {
    pub fn as_str(self) -> &'static str {
        match self { EngineFamily::Mysql => "MYSQL", EngineFamily::Postgresql => "POSTGRESQL" }
    }

    /// Value given to `client_password_auth_type` when an auth entry leaves it unset.
    /// MYSQL has none; the proxy then falls back to the provider's own default.
    pub fn default_client_password_auth_type(self) -> Option<&'static str> {
        match self {
            EngineFamily::Postgresql => Some("POSTGRES_SCRAM_SHA_256"),
            EngineFamily::Mysql => None,
        }
    }
}

impl fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

fn default_true() -> bool { true }
fn default_iam_role_max_session_duration() -> u32 { 43200 }
fn default_idle_client_timeout() -> u32 { 1800 }
fn default_log_group_retention_in_days() -> u32 { 30 }
fn default_max_connections_percent() -> u32 { 90 }
fn default_max_idle_connections_percent() -> u32 { 50 }

/// Parameters for one RDS Proxy: auth, pooling, IAM role and networking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub region: String,
    pub identifier: String,
    #[serde(default)]
    pub output_resource_name: Option<String>,
    pub tags: BTreeMap<String, String>,

    pub auth: Vec<AuthEntry>,
    #[serde(default)]
    pub connection_borrow_timeout: Option<u32>,
    pub db_instance_identifier: String,
    #[serde(default)]
    pub debug_logging: bool,
    #[serde(default)]
    pub engine_family: EngineFamily,
    #[serde(default = "default_true")]
    pub iam_role_force_detach_policies: bool,
    #[serde(default = "default_iam_role_max_session_duration")]
    pub iam_role_max_session_duration: u32,
    #[serde(default = "default_idle_client_timeout")]
    pub idle_client_timeout: u32,
    #[serde(default)]
    pub init_query: String,
    #[serde(default = "default_log_group_retention_in_days")]
    pub log_group_retention_in_days: u32,
    #[serde(default = "default_max_connections_percent")]
    pub max_connections_percent: u32,
    #[serde(default = "default_max_idle_connections_percent")]
    pub max_idle_connections_percent: u32,
    #[serde(default = "default_true")]
    pub require_tls: bool,
    #[serde(default)]
    pub session_pinning_filters: Vec<String>,
    pub vpc_security_group_ids: Vec<String>,
    pub vpc_subnet_ids: Vec<String>,
}

impl ProxyConfig {
    /// Decode `raw` and apply defaults; the first inconsistency rejects the whole input.
    pub fn validate(raw: Json) -> Result<Self, SchemaError> {
        let mut cfg: ProxyConfig = serde_json::from_value(raw)?;
        cfg.normalize()?;
        Ok(cfg)
    }

    fn normalize(&mut self) -> Result<(), SchemaError> {
        for (index, entry) in self.auth.iter_mut().enumerate() {
            entry.normalize(index)?;
        }
        if let Some(auth_type) = self.engine_family.default_client_password_auth_type() {
            for entry in self.auth.iter_mut().filter(|e| e.client_password_auth_type.is_none()) {
                entry.client_password_auth_type = Some(auth_type.to_string());
            }
        }
        if self.auth.is_empty() { return Err(SchemaError::EmptyAuth) }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleProvisionData {
    pub tf_state_bucket: String,
    pub tf_state_region: String,
    pub tf_state_dynamodb_table: String,
    pub tf_state_key: String,
}

/// Provisioning envelope that accompanies the proxy parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    pub provision_provider: String,
    pub provisioner: String,
    pub provider: String,
    pub identifier: String,
    pub target_cluster: String,
    pub target_namespace: String,
    #[serde(default)]
    pub target_secret_name: Option<String>,
    pub module_provision_data: ModuleProvisionData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInterfaceInput {
    pub data: ProxyConfig,
    pub provision: Provision,
}

impl AppInterfaceInput {
    pub fn validate(raw: Json) -> Result<Self, SchemaError> {
        let mut input: AppInterfaceInput = serde_json::from_value(raw)?;
        input.data.normalize()?;
        Ok(input)
    }
}
