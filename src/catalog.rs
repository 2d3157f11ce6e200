//! The token catalogue: every configured recipient identity, indexed for
//! the two lookups the daemon performs: by fingerprint (the primary
//! handle, used for brute-force enumeration) and by issuer/serial (CMS
//! recipient routing). One token is designated *current* and receives all
//! new encryptions.

use std::collections::HashMap;

use tracing::warn;

use crate::config::TokenSettings;
use crate::der::RecipientId;
use crate::error::{KeeperError, Result};
use crate::token::Token;

pub struct TokenCatalog {
    /// Fingerprint → token. Fingerprints are unique; a duplicate
    /// certificate configured twice keeps its first entry.
    by_fingerprint: HashMap<String, Token>,
    /// (issuer Name DER, serial octets) → fingerprint.
    by_issuer_serial: HashMap<(Vec<u8>, Vec<u8>), String>,
    /// Fingerprint of the token with the greatest NotBefore.
    current: Option<String>,
    /// Fingerprints in configured order; fixes enumeration order and the
    /// current-token tie-break.
    order: Vec<String>,
}

impl TokenCatalog {
    /// Load every configured token section and build the indexes.
    ///
    /// Any failing token aborts the load; the caller decides whether that
    /// is fatal (startup) or keeps the previous catalogue (reload).
    pub fn load(settings: &[TokenSettings]) -> Result<TokenCatalog> {
        let mut tokens = Vec::with_capacity(settings.len());
        for section in settings {
            tokens.push(Token::load(
                &section.name,
                &section.certificate,
                &section.key,
                section.passphrase.clone(),
            )?);
        }
        Ok(Self::from_tokens(tokens))
    }

    /// Build a catalogue from already-loaded tokens (configured order).
    pub fn from_tokens(tokens: Vec<Token>) -> TokenCatalog {
        let mut by_fingerprint = HashMap::new();
        let mut by_issuer_serial = HashMap::new();
        let mut order = Vec::new();

        for token in tokens {
            let fingerprint = token.info.fingerprint.clone();
            if by_fingerprint.contains_key(&fingerprint) {
                warn!(
                    token = %token.name,
                    fingerprint = %fingerprint,
                    "duplicate certificate configured, keeping first entry"
                );
                continue;
            }
            by_issuer_serial.insert(token.issuer_serial.clone(), fingerprint.clone());
            order.push(fingerprint.clone());
            by_fingerprint.insert(fingerprint, token);
        }

        // Greatest NotBefore wins; the 14-digit form makes a string compare
        // equivalent to a numeric one. Strict comparison keeps the first
        // configured token on ties.
        let mut current: Option<&str> = None;
        for fingerprint in &order {
            let token = &by_fingerprint[fingerprint];
            let beats = match current {
                Some(cur) => token.info.not_before > by_fingerprint[cur].info.not_before,
                None => true,
            };
            if beats {
                current = Some(fingerprint);
            }
        }
        let current = current.map(str::to_string);

        TokenCatalog {
            by_fingerprint,
            by_issuer_serial,
            current,
            order,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// The token used for all new encryptions.
    pub fn select_for_encrypt(&self) -> Result<&Token> {
        self.current
            .as_deref()
            .and_then(|fp| self.by_fingerprint.get(fp))
            .ok_or(KeeperError::NoEncryptionToken)
    }

    /// Walk CMS recipient identities in order and return the first token
    /// the ciphertext was addressed to, if any.
    pub fn select_for_decrypt(&self, recipients: &[RecipientId]) -> Option<&Token> {
        recipients.iter().find_map(|rid| {
            self.by_issuer_serial
                .get(&(rid.issuer.clone(), rid.serial.clone()))
                .and_then(|fp| self.by_fingerprint.get(fp))
        })
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> Option<&Token> {
        self.by_fingerprint.get(fingerprint)
    }

    /// All tokens in configured order.
    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.order
            .iter()
            .filter_map(move |fp| self.by_fingerprint.get(fp))
    }

    /// Drop the recipient-routing index, forcing enumeration. Exists so
    /// tests can exercise the brute-force fallback path.
    #[cfg(test)]
    pub(crate) fn clear_recipient_index(&mut self) {
        self.by_issuer_serial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn newest_not_before_becomes_current() {
        let dir = tempfile::tempdir().unwrap();
        let old = testutil::generate_token(dir.path(), "old", -86_400 * 365);
        let new = testutil::generate_token(dir.path(), "new", -3_600);
        let new_fp = new.info.fingerprint.clone();

        let catalog = TokenCatalog::from_tokens(vec![old, new]);
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.select_for_encrypt().unwrap().info.fingerprint,
            new_fp
        );
    }

    #[test]
    fn tie_breaks_to_first_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = testutil::generate_token(dir.path(), "a", -600);
        let mut b = testutil::generate_token(dir.path(), "b", -600);
        // Force identical NotBefore regardless of generation timing.
        a.info.not_before = "20260101000000".into();
        b.info.not_before = "20260101000000".into();
        let a_fp = a.info.fingerprint.clone();

        let catalog = TokenCatalog::from_tokens(vec![a, b]);
        assert_eq!(catalog.select_for_encrypt().unwrap().info.fingerprint, a_fp);
    }

    #[test]
    fn empty_catalog_has_no_encryption_token() {
        let catalog = TokenCatalog::from_tokens(Vec::new());
        assert!(catalog.is_empty());
        assert!(matches!(
            catalog.select_for_encrypt(),
            Err(KeeperError::NoEncryptionToken)
        ));
    }

    #[test]
    fn recipient_routing_finds_the_matching_token() {
        let dir = tempfile::tempdir().unwrap();
        let t1 = testutil::generate_token(dir.path(), "t1", -7_200);
        let t2 = testutil::generate_token(dir.path(), "t2", -3_600);
        let t1_id = RecipientId {
            issuer: t1.issuer_serial.0.clone(),
            serial: t1.issuer_serial.1.clone(),
        };
        let t1_fp = t1.info.fingerprint.clone();

        let catalog = TokenCatalog::from_tokens(vec![t1, t2]);
        let found = catalog.select_for_decrypt(&[t1_id]).unwrap();
        assert_eq!(found.info.fingerprint, t1_fp);

        let stranger = RecipientId {
            issuer: vec![0x30, 0x00],
            serial: vec![0x01],
        };
        assert!(catalog.select_for_decrypt(&[stranger]).is_none());
    }

    #[test]
    fn load_fails_cleanly_on_missing_material() {
        let dir = tempfile::tempdir().unwrap();
        let settings = vec![TokenSettings {
            name: "ghost".into(),
            certificate: dir.path().join("ghost.crt"),
            key: dir.path().join("ghost.key"),
            passphrase: None,
        }];
        assert!(matches!(
            TokenCatalog::load(&settings),
            Err(KeeperError::TokenLoad(_))
        ));
    }
}
