//! Credential enumeration: managed directory files first, environment-sourced
//! virtual credentials second, with read-only imports from well-known external
//! tool locations.

use super::{env_uri, CredentialRecord, CredentialSecret, OAuthTokens};
use crate::store::StatePaths;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Highest numbered `<PROVIDER>_<N>_*` variable scanned per provider.
const MAX_ENV_INDEX: u32 = 16;

/// Legacy single-credential environment variable per provider (index 0).
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("openai", "OPENAI_API_KEY"),
    ("google-oauth", "GOOGLE_OAUTH_JSON"),
];

/// Well-known external credential files, imported read-only at startup.
fn external_import_sources() -> Vec<(String, PathBuf)> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    vec![
        ("google-oauth".into(), home.join(".gemini").join("oauth_creds.json")),
        (
            "google-oauth".into(),
            home.join(".config")
                .join("gcloud")
                .join("application_default_credentials.json"),
        ),
    ]
}

fn env_prefix(provider: &str) -> String {
    provider.to_ascii_uppercase().replace('-', "_")
}

pub struct CredentialStore {
    paths: StatePaths,
    records: RwLock<HashMap<String, CredentialRecord>>,
    providers: Vec<String>,
}

impl CredentialStore {
    /// Scan the managed directory and the environment for the given
    /// providers. Runs external imports first so freshly imported files are
    /// picked up by the same scan.
    pub fn open(paths: StatePaths, providers: &[&str]) -> Self {
        let store = Self {
            paths,
            records: RwLock::new(HashMap::new()),
            providers: providers.iter().map(|p| p.to_string()).collect(),
        };
        store.import_external_sources();
        store.reload();
        store
    }

    /// Re-enumerate all credentials. Returns how many are registered.
    pub fn reload(&self) -> usize {
        let mut found: Vec<CredentialRecord> = Vec::new();

        // Managed directory files take priority over environment variables.
        for provider in &self.providers {
            found.extend(self.scan_directory(provider));
        }
        for provider in &self.providers {
            found.extend(scan_environment(provider));
        }

        // Deduplicate by (provider, identity). First occurrence wins, which
        // preserves the file-over-environment priority.
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut records = HashMap::new();
        for record in found {
            let key = (record.provider.clone(), record.identity_key());
            if !seen.insert(key) {
                tracing::warn!(
                    credential = %record.display_label(),
                    "duplicate credential dropped"
                );
                continue;
            }
            records.insert(record.id.clone(), record);
        }

        let count = records.len();
        *self.records.write().expect("credential store lock") = records;
        count
    }

    /// Identifiers of every credential registered for a provider, file-backed
    /// first, in stable order.
    pub fn list(&self, provider: &str) -> Vec<String> {
        let records = self.records.read().expect("credential store lock");
        let mut ids: Vec<&CredentialRecord> =
            records.values().filter(|r| r.provider == provider).collect();
        ids.sort_by(|a, b| (a.is_env_backed(), &a.id).cmp(&(b.is_env_backed(), &b.id)));
        ids.into_iter().map(|r| r.id.clone()).collect()
    }

    pub fn load(&self, id: &str) -> Option<CredentialRecord> {
        self.records.read().expect("credential store lock").get(id).cloned()
    }

    /// Swap the in-memory tokens of an OAuth credential. Called by the token
    /// manager after the refreshed record has been persisted.
    pub fn update_tokens(&self, id: &str, tokens: OAuthTokens) {
        let mut records = self.records.write().expect("credential store lock");
        if let Some(record) = records.get_mut(id) {
            record.secret = CredentialSecret::OAuth(tokens);
        }
    }

    /// Remove a credential from the registry (explicit deletion only).
    pub fn remove(&self, id: &str) -> bool {
        self.records
            .write()
            .expect("credential store lock")
            .remove(id)
            .is_some()
    }

    fn scan_directory(&self, provider: &str) -> Vec<CredentialRecord> {
        let dir = self.paths.oauth_creds_dir();
        let mut records = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return records,
        };
        let prefix = format!("{provider}_oauth_");
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();
        paths.sort();

        for path in paths {
            match read_oauth_file(&path) {
                Ok(tokens) => records.push(CredentialRecord {
                    provider: provider.to_string(),
                    id: path.to_string_lossy().into_owned(),
                    secret: CredentialSecret::OAuth(tokens),
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable credential file");
                }
            }
        }
        records
    }

    /// Copy credentials from well-known external tool locations into the
    /// managed directory. Sources are never modified; existing managed files
    /// are never overwritten.
    fn import_external_sources(&self) {
        for (provider, source) in external_import_sources() {
            if !self.providers.contains(&provider) || !source.exists() {
                continue;
            }
            let Ok(tokens) = read_oauth_file(&source) else {
                continue;
            };
            let incoming_identity = tokens
                .metadata
                .email
                .clone()
                .or_else(|| tokens.metadata.account_id.clone())
                .unwrap_or_else(|| tokens.refresh_token.clone());
            let already_imported = self.scan_directory(&provider).iter().any(|r| {
                r.oauth().is_some_and(|t| {
                    t.refresh_token == tokens.refresh_token
                        || r.identity_key() == incoming_identity
                })
            });
            if already_imported {
                continue;
            }
            let index = self.next_free_index(&provider);
            let dest = self.paths.oauth_cred_file(&provider, index);
            if dest.exists() {
                continue;
            }
            if let Err(e) = copy_credential_file(&source, &dest) {
                tracing::warn!(source = %source.display(), error = %e, "credential import failed");
            } else {
                tracing::info!(source = %source.display(), dest = %dest.display(), "imported external credential");
            }
        }
    }

    fn next_free_index(&self, provider: &str) -> u32 {
        let mut index = 0;
        while self.paths.oauth_cred_file(provider, index).exists() {
            index += 1;
        }
        index
    }
}

fn read_oauth_file(path: &Path) -> anyhow::Result<OAuthTokens> {
    let content = fs::read_to_string(path)?;
    let tokens: OAuthTokens = serde_json::from_str(&content)?;
    Ok(tokens)
}

fn copy_credential_file(source: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }
    }
    fs::copy(source, dest)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(dest, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Environment enumeration
// ---------------------------------------------------------------------------

fn scan_environment(provider: &str) -> Vec<CredentialRecord> {
    let mut records = Vec::new();
    let prefix = env_prefix(provider);

    // Index 0: legacy single-credential names.
    if let Some((_, legacy)) = LEGACY_ENV_KEYS.iter().find(|(p, _)| *p == provider) {
        if let Some(record) = env_record(provider, 0, legacy) {
            records.push(record);
        }
    }

    // Indices >= 1: numbered variants, both static keys and OAuth blobs.
    for index in 1..=MAX_ENV_INDEX {
        let key_var = format!("{prefix}_{index}_API_KEY");
        let json_var = format!("{prefix}_{index}_OAUTH_JSON");
        if let Some(record) = env_record(provider, index, &key_var) {
            records.push(record);
        } else if let Some(record) = env_record(provider, index, &json_var) {
            records.push(record);
        }
    }
    records
}

fn env_record(provider: &str, index: u32, var: &str) -> Option<CredentialRecord> {
    let raw = std::env::var(var).ok()?;
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    let secret = if var.ends_with("_OAUTH_JSON") || value.starts_with('{') {
        let mut tokens: OAuthTokens = match serde_json::from_str(value) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(var, error = %e, "ignoring malformed OAuth JSON in environment");
                return None;
            }
        };
        tokens.metadata.loaded_from_env = true;
        tokens.metadata.env_credential_index = Some(index);
        CredentialSecret::OAuth(tokens)
    } else {
        CredentialSecret::StaticKey { key: value.to_string() }
    };
    Some(CredentialRecord {
        provider: provider.to_string(),
        id: env_uri(provider, index),
        secret,
    })
}
