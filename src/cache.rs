//! The cache layer in front of the persistent store.
//!
//! Two strategies. `preload` keeps a process-local map, filled by scanning
//! the store at startup; hits are authoritative. `memcache` additionally
//! places values in an untrusted shared cache, sealed with AES-256-GCM
//! under a per-process instance key with the cache key string as associated
//! data: confidentiality from the key, authenticity from the AAD binding.
//! Anything that fails to open (tampering, another instance's entry,
//! truncation) is treated as a miss, never an error.

use std::collections::HashMap;
use std::sync::RwLock;

use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::catalog::TokenCatalog;
use crate::error::Result;
use crate::memcache::MemcacheClient;
use crate::store::SecretStore;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Ephemeral symmetric key protecting shared-cache entries. Generated at
/// startup, never written to disk, never logged, wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct InstanceKey {
    key: [u8; KEY_LEN],
}

impl InstanceKey {
    pub fn generate() -> Result<InstanceKey> {
        let mut key = [0u8; KEY_LEN];
        openssl::rand::rand_bytes(&mut key)?;
        Ok(InstanceKey { key })
    }

    /// Seal `plaintext` for the shared cache: `nonce || tag || ciphertext`,
    /// with `cache_key` bound as associated data.
    fn seal(&self, cache_key: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        openssl::rand::rand_bytes(&mut nonce)?;
        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(&nonce),
            cache_key.as_bytes(),
            plaintext,
            &mut tag,
        )?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&tag);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed shared-cache value. Any failure is `None`.
    fn open(&self, cache_key: &str, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        decrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(nonce),
            cache_key.as_bytes(),
            ciphertext,
            tag,
        )
        .ok()
    }
}

/// Shared-cache backend: the memcached client plus the sealing key.
struct SharedCache {
    client: MemcacheClient,
    key: InstanceKey,
}

pub struct SecretCache {
    namespace: String,
    local: RwLock<HashMap<String, Vec<u8>>>,
    shared: Option<SharedCache>,
}

impl SecretCache {
    /// Process-local preload strategy.
    pub fn preload(namespace: &str) -> SecretCache {
        SecretCache {
            namespace: namespace.to_string(),
            local: RwLock::new(HashMap::new()),
            shared: None,
        }
    }

    /// Shared-cache strategy; the local map is still consulted first.
    pub fn memcache(namespace: &str, client: MemcacheClient) -> Result<SecretCache> {
        Ok(SecretCache {
            namespace: namespace.to_string(),
            local: RwLock::new(HashMap::new()),
            shared: Some(SharedCache {
                client,
                key: InstanceKey::generate()?,
            }),
        })
    }

    /// `skeepd:<namespace>:<secret_key>:`
    fn cache_key(&self, key: &str) -> String {
        format!("skeepd:{}:{}:", self.namespace, key)
    }

    /// Scan the store and decrypt every slot into the local map. Slots that
    /// fail to decrypt are logged and skipped; they will fail (or succeed
    /// against a reloaded catalogue) on the lazy path instead.
    pub fn warm(&self, store: &SecretStore, catalog: &TokenCatalog) -> Result<usize> {
        let mut loaded = 0;
        for key in store.keys()? {
            match store.get(catalog, &key) {
                Ok(Some(value)) => {
                    self.local.write().unwrap().insert(key, value);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, "preload skipped undecryptable slot: {e}"),
            }
        }
        debug!(namespace = %self.namespace, loaded, "cache warmed");
        Ok(loaded)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.local.read().unwrap().get(key).cloned() {
            return Some(value);
        }
        let shared = self.shared.as_ref()?;
        let cache_key = self.cache_key(key);
        match shared.client.get(&cache_key) {
            Ok(Some(sealed)) => match shared.key.open(&cache_key, &sealed) {
                Some(value) => {
                    self.local
                        .write()
                        .unwrap()
                        .insert(key.to_string(), value.clone());
                    Some(value)
                }
                None => {
                    warn!(key, "shared cache entry failed authentication, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(key, "shared cache unreachable: {e}");
                None
            }
        }
    }

    pub fn insert(&self, key: &str, value: &[u8]) {
        self.local
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        if let Some(shared) = &self.shared {
            let cache_key = self.cache_key(key);
            match shared.key.seal(&cache_key, value) {
                Ok(sealed) => {
                    if let Err(e) = shared.client.set(&cache_key, &sealed) {
                        debug!(key, "shared cache write failed: {e}");
                    }
                }
                Err(e) => warn!(key, "could not seal value for shared cache: {e}"),
            }
        }
    }

    /// Drop a key from the local map. Exists for tests that need to force
    /// the shared-cache or store path.
    #[cfg(test)]
    pub(crate) fn evict_local(&self, key: &str) {
        self.local.write().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn preload_scans_and_serves_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let token = testutil::generate_token(dir.path(), "warm", -60);
        let catalog = TokenCatalog::from_tokens(vec![token]);
        let store = SecretStore::open(&dir.path().join("slots"), None).unwrap();
        store.put(&catalog, "one", b"1").unwrap();
        store.put(&catalog, "two", b"2").unwrap();

        let cache = SecretCache::preload("ns");
        assert_eq!(cache.warm(&store, &catalog).unwrap(), 2);
        assert_eq!(cache.get("one").unwrap(), b"1");
        assert_eq!(cache.get("two").unwrap(), b"2");
        assert!(cache.get("three").is_none());
    }

    #[test]
    fn insert_then_get_round_trips() {
        let cache = SecretCache::preload("ns");
        cache.insert("k", b"\x00\xff\r\n");
        assert_eq!(cache.get("k").unwrap(), b"\x00\xff\r\n");
    }

    #[test]
    fn seal_open_round_trip() {
        let key = InstanceKey::generate().unwrap();
        let sealed = key.seal("skeepd:ns:k:", b"secret value").unwrap();
        assert_eq!(
            key.open("skeepd:ns:k:", &sealed).unwrap(),
            b"secret value"
        );
    }

    #[test]
    fn any_flipped_byte_fails_authentication() {
        let key = InstanceKey::generate().unwrap();
        let sealed = key.seal("skeepd:ns:k:", b"secret value").unwrap();
        for i in 0..sealed.len() {
            let mut corrupt = sealed.clone();
            corrupt[i] ^= 0x01;
            assert!(
                key.open("skeepd:ns:k:", &corrupt).is_none(),
                "byte {i} flip went unnoticed"
            );
        }
    }

    #[test]
    fn wrong_cache_key_fails_authentication() {
        let key = InstanceKey::generate().unwrap();
        let sealed = key.seal("skeepd:ns:k:", b"v").unwrap();
        assert!(key.open("skeepd:ns:other:", &sealed).is_none());
    }

    #[test]
    fn foreign_instance_key_cannot_open() {
        let ours = InstanceKey::generate().unwrap();
        let theirs = InstanceKey::generate().unwrap();
        let sealed = ours.seal("skeepd:ns:k:", b"v").unwrap();
        assert!(theirs.open("skeepd:ns:k:", &sealed).is_none());
    }

    #[test]
    fn truncated_sealed_value_is_a_miss() {
        let key = InstanceKey::generate().unwrap();
        assert!(key.open("skeepd:ns:k:", &[0u8; 5]).is_none());
    }

    #[test]
    fn shared_cache_round_trips_through_the_wire() {
        let (addr, table) = testutil::spawn_fake_memcached();
        let cache =
            SecretCache::memcache("ns", MemcacheClient::new(vec![addr])).unwrap();

        cache.insert("db_password", b"hunter2");
        // The entry on the wire is sealed, not plaintext.
        let stored = table
            .lock()
            .unwrap()
            .get("skeepd:ns:db_password:")
            .cloned()
            .unwrap();
        assert!(!stored.windows(7).any(|w| w == &b"hunter2"[..]));

        // A fresh read through the shared cache (local map emptied) opens it.
        cache.evict_local("db_password");
        assert_eq!(cache.get("db_password").unwrap(), b"hunter2");
    }

    #[test]
    fn tampered_shared_entry_falls_through_to_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let token = testutil::generate_token(dir.path(), "shared", -60);
        let catalog = TokenCatalog::from_tokens(vec![token]);
        let store = SecretStore::open(&dir.path().join("slots"), None).unwrap();
        store.put(&catalog, "api_token", b"authoritative").unwrap();

        let (addr, table) = testutil::spawn_fake_memcached();
        let cache =
            SecretCache::memcache("ns", MemcacheClient::new(vec![addr])).unwrap();
        cache.insert("api_token", b"authoritative");

        // Flip one ciphertext byte in the shared cache.
        {
            let mut table = table.lock().unwrap();
            let entry = table.get_mut("skeepd:ns:api_token:").unwrap();
            let last = entry.len() - 1;
            entry[last] ^= 0x01;
        }
        cache.evict_local("api_token");

        // The cache reports a miss, and the worker path serves the store's
        // value, exactly as a get request would.
        assert!(cache.get("api_token").is_none());
        assert_eq!(
            store.get(&catalog, "api_token").unwrap().unwrap(),
            b"authoritative"
        );
    }

    #[test]
    fn two_instances_do_not_share_entries() {
        let (addr, _table) = testutil::spawn_fake_memcached();
        let first =
            SecretCache::memcache("ns", MemcacheClient::new(vec![addr.clone()])).unwrap();
        let second = SecretCache::memcache("ns", MemcacheClient::new(vec![addr])).unwrap();

        first.insert("k", b"mine");
        // Same namespace, same shared cache, different instance key: the
        // second daemon must not accept the first one's entry.
        assert!(second.get("k").is_none());
    }
}
