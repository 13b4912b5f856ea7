//! Catalog API credentials stored in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Environment variables take
//! precedence so headless deployments can run without a keyring daemon.

use keyring::Entry;
use tracing::warn;
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "catalog-sync";

// Credential keys
const KEY_MACHINE_ID: &str = "machine_id";
const KEY_MACHINE_KEY: &str = "machine_key";
const KEY_INTEGRATOR_ID: &str = "integrator_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_MACHINE_ID, KEY_MACHINE_KEY, KEY_INTEGRATOR_ID];

/// The three API keys sent with every catalog request.
///
/// The machine key is wiped from memory when the value is dropped.
#[derive(Clone)]
pub struct ApiCredentials {
    pub machine_id: String,
    pub machine_key: Zeroizing<String>,
    pub integrator_id: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("machine_id", &self.machine_id)
            .field("machine_key", &"***")
            .field("integrator_id", &self.integrator_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

fn env_credential(key: &str) -> Option<String> {
    let var = format!("CATALOG_SYNC_{}", key.to_uppercase());
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn lookup(key: &str) -> Option<String> {
    env_credential(key).or_else(|| get_credential(key))
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Load the API credentials, environment first, keyring second.
pub fn load_credentials() -> Option<ApiCredentials> {
    Some(ApiCredentials {
        machine_id: lookup(KEY_MACHINE_ID)?,
        machine_key: Zeroizing::new(lookup(KEY_MACHINE_KEY)?),
        integrator_id: lookup(KEY_INTEGRATOR_ID)?,
    })
}

/// Persist the API credentials in the OS keyring.
pub fn store_credentials(credentials: &ApiCredentials) -> Result<(), String> {
    validate_machine_key(&credentials.machine_key)?;
    validate_guid("machine id", &credentials.machine_id)?;
    validate_guid("integrator id", &credentials.integrator_id)?;
    set_credential(KEY_MACHINE_ID, credentials.machine_id.trim())?;
    set_credential(KEY_MACHINE_KEY, credentials.machine_key.trim())?;
    set_credential(KEY_INTEGRATOR_ID, credentials.integrator_id.trim())?;
    Ok(())
}

/// Remove every stored credential.
pub fn clear_credentials() -> Result<(), String> {
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

/// The machine key is a 32-digit hexadecimal number.
pub fn validate_machine_key(key: &str) -> Result<(), String> {
    let trimmed = key.trim();
    if trimmed.len() != 32 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("Machine key must be a 32-digit hexadecimal number".to_string());
    }
    Ok(())
}

/// Machine and integrator ids are GUIDs (`xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`).
pub fn validate_guid(label: &str, value: &str) -> Result<(), String> {
    let groups: Vec<&str> = value.trim().split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    let valid = groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        Err(format!(
            "The {label} must have the format xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
        ))
    }
}
