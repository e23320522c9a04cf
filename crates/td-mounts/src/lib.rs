//! Resolves the inline "mounts" document the invoker reads from standard
//! input into a flat `TDS_<ID>_<KEY>` environment map, lazily resolving
//! literal, environment, and vault-backed secret values.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use td_errors::WorkerError;

/// A secret value as it appears inline in the mounts document. `Direct`
/// carries its own sentinel tag in the serialized form precisely so a
/// plaintext-looking string in a log or diff is never mistaken for a
/// resolved one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretValue {
    Direct(String),
    Env(String),
    Vault { path: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub id: String,
    pub options: BTreeMap<String, SecretValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountsDocument {
    pub storage: StorageSection,
}

/// Reads key/value secrets from a vault-like backend. `read_kv` returns the
/// full `data.data` map at `path`; callers pick out the named entry.
#[async_trait]
pub trait VaultClient: Send + Sync {
    async fn read_kv(&self, path: &str) -> Result<BTreeMap<String, String>, WorkerError>;
}

/// A [`VaultClient`] backed by a HashiCorp-Vault-style KV v2 HTTP API.
pub struct HttpVaultClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpVaultClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VaultKvResponse {
    data: VaultKvData,
}

#[derive(Debug, Deserialize)]
struct VaultKvData {
    data: BTreeMap<String, String>,
}

#[async_trait]
impl VaultClient for HttpVaultClient {
    async fn read_kv(&self, path: &str) -> Result<BTreeMap<String, String>, WorkerError> {
        let url = format!("{}/v1/{path}", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| WorkerError::configuration("VaultUnreachable", e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::configuration("VaultUnreachable", e.to_string()))?;
        let body: VaultKvResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::configuration("VaultMalformedResponse", e.to_string()))?;
        Ok(body.data.data)
    }
}

/// Parses the mounts document from its YAML wire form.
pub fn parse(yaml: &str) -> Result<MountsDocument, WorkerError> {
    serde_yaml::from_str(yaml)
        .map_err(|e| WorkerError::configuration("MalformedMountsDocument", e.to_string()))
}

async fn resolve_secret(value: &SecretValue, vault: &dyn VaultClient) -> Result<String, WorkerError> {
    match value {
        SecretValue::Direct(v) => Ok(v.clone()),
        SecretValue::Env(name) => std::env::var(name)
            .map_err(|_| WorkerError::configuration("MissingEnv", format!("environment variable {name} is not set"))),
        SecretValue::Vault { path, name } => {
            let kv = vault.read_kv(path).await?;
            kv.get(name).cloned().ok_or_else(|| {
                WorkerError::configuration(
                    "VaultSecretMissing",
                    format!("vault path {path} has no entry named {name}"),
                )
            })
        },
    }
}

/// Resolves every option of every mount into a flat `TDS_<ID>_<KEY>` map
/// (both segments uppercased), then expands any `${env:NAME}` /
/// `${env:NAME?}` placeholders left in the resolved values, then overlays
/// any already-resolved `TDS_*` variables already present in the process
/// environment (lower priority, for re-entrant invocations that inherit a
/// parent's resolved mounts).
pub async fn resolve(document: &MountsDocument, vault: &dyn VaultClient) -> Result<BTreeMap<String, String>, WorkerError> {
    let mut resolved = passthrough_env();

    for mount in &document.storage.mounts {
        for (key, value) in &mount.options {
            let raw = resolve_secret(value, vault).await?;
            let expanded = expand_env_placeholders(&raw)?;
            let env_key = format!("TDS_{}_{}", mount.id.to_ascii_uppercase(), key.to_ascii_uppercase());
            resolved.insert(env_key, expanded);
        }
    }
    Ok(resolved)
}

fn passthrough_env() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("TDS_"))
        .collect()
}

/// Expands `${env:NAME}` (mandatory) and `${env:NAME?}` (optional,
/// collapses to empty when unset) placeholders found anywhere in `input`.
pub fn expand_env_placeholders(input: &str) -> Result<String, WorkerError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${env:") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "${env:".len()..];
        let end = after.find('}').ok_or_else(|| {
            WorkerError::configuration(
                "MalformedPlaceholder",
                format!("unterminated ${{env:...}} placeholder in {input:?}"),
            )
        })?;
        let mut name = &after[..end];
        let optional = name.ends_with('?');
        if optional {
            name = &name[..name.len() - 1];
        }
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) if optional => {},
            Err(_) => {
                return Err(WorkerError::configuration(
                    "MissingEnv",
                    format!("environment variable {name} is not set"),
                ))
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct StubVault(BTreeMap<String, BTreeMap<String, String>>);

    #[async_trait]
    impl VaultClient for StubVault {
        async fn read_kv(&self, path: &str) -> Result<BTreeMap<String, String>, WorkerError> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| WorkerError::configuration("VaultSecretMissing", path.to_owned()))
        }
    }

    // Environment variable tests mutate process-global state; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn direct_values_carry_the_sentinel_tag() {
        let yaml = "direct: hello\n";
        let value: SecretValue = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(value, SecretValue::Direct("hello".to_owned()));
    }

    #[tokio::test]
    async fn resolves_direct_env_and_vault_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("TD_TEST_SECRET", "from-env");

        let mut options = BTreeMap::new();
        options.insert("KEY1".to_owned(), SecretValue::Direct("literal".to_owned()));
        options.insert(
            "KEY2".to_owned(),
            SecretValue::Env("TD_TEST_SECRET".to_owned()),
        );
        options.insert(
            "KEY3".to_owned(),
            SecretValue::Vault {
                path: "secret/data/db".to_owned(),
                name: "password".to_owned(),
            },
        );
        let document = MountsDocument {
            storage: StorageSection {
                mounts: vec![Mount {
                    id: "main".to_owned(),
                    options,
                }],
            },
        };

        let mut vault_data = BTreeMap::new();
        let mut db = BTreeMap::new();
        db.insert("password".to_owned(), "s3cr3t".to_owned());
        vault_data.insert("secret/data/db".to_owned(), db);
        let vault = StubVault(vault_data);

        let resolved = resolve(&document, &vault).await.unwrap();
        assert_eq!(resolved.get("TDS_MAIN_KEY1"), Some(&"literal".to_owned()));
        assert_eq!(resolved.get("TDS_MAIN_KEY2"), Some(&"from-env".to_owned()));
        assert_eq!(resolved.get("TDS_MAIN_KEY3"), Some(&"s3cr3t".to_owned()));

        std::env::remove_var("TD_TEST_SECRET");
    }

    #[test]
    fn optional_placeholder_collapses_to_empty_when_missing() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("TD_DOES_NOT_EXIST");
        let expanded = expand_env_placeholders("prefix-${env:TD_DOES_NOT_EXIST?}-suffix").unwrap();
        assert_eq!(expanded, "prefix--suffix");
    }

    #[test]
    fn mandatory_placeholder_fails_when_missing() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("TD_DOES_NOT_EXIST");
        let err = expand_env_placeholders("${env:TD_DOES_NOT_EXIST}").unwrap_err();
        assert_eq!(err.short_msg, "MissingEnv");
    }

    #[test]
    fn placeholder_is_expanded_when_present() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("TD_HOST", "db.internal");
        let expanded = expand_env_placeholders("jdbc://${env:TD_HOST}:5432").unwrap();
        assert_eq!(expanded, "jdbc://db.internal:5432");
        std::env::remove_var("TD_HOST");
    }
}
