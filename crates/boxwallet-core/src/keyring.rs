//! Session-owned cache of loaded wallet keys.
//!
//! Keys are indexed by the hex of their account public key. Components
//! receive the ring explicitly; a lookup miss is a `NotLoaded` error rather
//! than a silent re-derivation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::WalletError;
use crate::keys::ExtendedKey;
use crate::types::Wallet;

#[derive(Default)]
pub struct KeyRing {
    keys: RwLock<HashMap<String, Arc<ExtendedKey>>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `key`, returning the id it is stored under. Loading the same
    /// account twice keeps the first instance, unless the cached one is
    /// neutered and `key` can sign.
    pub async fn insert(&self, key: ExtendedKey) -> (String, Arc<ExtendedKey>) {
        let id = key.fingerprint_hex();
        let mut keys = self.keys.write().await;
        let store = match keys.get(&id) {
            Some(cached) => cached.is_neutered() && !key.is_neutered(),
            None => true,
        };
        let entry = if store {
            let key = Arc::new(key);
            if keys.insert(id.clone(), Arc::clone(&key)).is_some() {
                tracing::debug!(key = %id, "replaced cached public key with private key");
            }
            key
        } else {
            Arc::clone(&keys[&id])
        };
        (id, entry)
    }

    /// Load the public node of `wallet` from its exported extended key.
    pub async fn load_public(&self, wallet: &Wallet) -> Result<Arc<ExtendedKey>, WalletError> {
        let key = ExtendedKey::from_extended_public_key(&wallet.extended_public_key)?;
        let (id, key) = self.insert(key).await;
        tracing::debug!(wallet_id = %wallet.id, key = %id, "loaded public key");
        Ok(key)
    }

    pub async fn get(&self, public_key_hex: &str) -> Result<Arc<ExtendedKey>, WalletError> {
        self.keys
            .read()
            .await
            .get(public_key_hex)
            .cloned()
            .ok_or_else(|| WalletError::NotLoaded(public_key_hex.to_owned()))
    }

    /// Key for `wallet`, resolved through its exported public key.
    pub async fn for_wallet(&self, wallet: &Wallet) -> Result<Arc<ExtendedKey>, WalletError> {
        let public = ExtendedKey::from_extended_public_key(&wallet.extended_public_key)?;
        self.get(&public.fingerprint_hex()).await
    }

    /// Drop a key from the session. Outstanding `Arc`s keep working until
    /// released; the secret is wiped when the last one drops.
    pub async fn remove(&self, public_key_hex: &str) -> bool {
        self.keys.write().await.remove(public_key_hex).is_some()
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use crate::types::WalletKind;

    #[tokio::test]
    async fn miss_is_not_loaded() {
        let ring = KeyRing::new();
        assert!(matches!(
            ring.get("02ab").await,
            Err(WalletError::NotLoaded(_))
        ));
        assert!(matches!(
            ring.for_wallet(&test_wallet(WalletKind::Standard)).await,
            Err(WalletError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn inserted_key_resolves_by_wallet() {
        let ring = KeyRing::new();
        let (id, _) = ring.insert(test_key()).await;
        let (again, _) = ring.insert(test_key()).await;
        assert_eq!(id, again);
        assert_eq!(ring.len().await, 1);

        let key = ring
            .for_wallet(&test_wallet(WalletKind::Standard))
            .await
            .expect("loaded");
        assert!(!key.is_neutered());
        assert!(ring.remove(&id).await);
        assert!(ring.is_empty().await);
    }

    #[tokio::test]
    async fn public_load_is_neutered() {
        let ring = KeyRing::new();
        let key = ring
            .load_public(&test_wallet(WalletKind::ReadOnly))
            .await
            .expect("load");
        assert!(key.is_neutered());
    }

    #[tokio::test]
    async fn private_key_replaces_cached_public_key() {
        let ring = KeyRing::new();
        let wallet = test_wallet(WalletKind::Standard);
        ring.load_public(&wallet).await.expect("load");

        let (_, returned) = ring.insert(test_key()).await;
        assert!(!returned.is_neutered());
        let resolved = ring.for_wallet(&wallet).await.expect("loaded");
        assert!(!resolved.is_neutered());
        assert_eq!(ring.len().await, 1);

        // A later public load does not downgrade it.
        let again = ring.load_public(&wallet).await.expect("load");
        assert!(!again.is_neutered());
    }
}
