//! CMS envelope encryption for persistent slots.
//!
//! The write side produces a PEM-encoded EnvelopedData structure addressed
//! to one recipient certificate (AES-256 content encryption). The read side
//! routes the blob's recipient infos through the catalogue and falls back
//! to brute-force enumeration over every configured token when routing
//! fails, so a slot stays readable as long as any configured key opens it.

use openssl::cms::{CMSOptions, CmsContentInfo};
use openssl::stack::Stack;
use openssl::symm::Cipher;
use tracing::warn;

use crate::catalog::TokenCatalog;
use crate::der;
use crate::error::{KeeperError, Result};
use crate::token::Token;

/// Envelope-encrypt `plaintext` to one recipient, returning PEM bytes.
pub fn seal(token: &Token, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut recipients = Stack::new()?;
    recipients.push(token.certificate.clone())?;
    let cms = CmsContentInfo::encrypt(
        &recipients,
        plaintext,
        Cipher::aes_256_cbc(),
        CMSOptions::BINARY,
    )?;
    Ok(cms.to_pem()?)
}

/// Decrypt a PEM envelope using whichever catalogue token it was addressed
/// to. `label` names the slot in log lines.
pub fn open(catalog: &TokenCatalog, pem: &[u8], label: &str) -> Result<Vec<u8>> {
    let cms = CmsContentInfo::from_pem(pem)
        .map_err(|e| KeeperError::Crypto(format!("'{label}': envelope parse failed: {e}")))?;

    match cms.to_der().map_err(KeeperError::from).and_then(|d| der::cms_recipient_ids(&d)) {
        Ok(recipients) => {
            if let Some(token) = catalog.select_for_decrypt(&recipients) {
                match cms.decrypt(&token.key, &token.certificate) {
                    Ok(plaintext) => return Ok(plaintext),
                    Err(e) => warn!(
                        slot = label,
                        token = %token.name,
                        "matched recipient token failed to decrypt: {e}"
                    ),
                }
            }
        }
        Err(e) => warn!(slot = label, "recipient info unreadable: {e}"),
    }

    open_with_any(catalog, &cms, label)
}

/// Try every configured token in order, recipient checks included and then
/// bypassed. First success wins; total failure means no usable key.
fn open_with_any(catalog: &TokenCatalog, cms: &CmsContentInfo, label: &str) -> Result<Vec<u8>> {
    for token in catalog.tokens() {
        if let Ok(plaintext) = cms.decrypt(&token.key, &token.certificate) {
            warn!(
                slot = label,
                token = %token.name,
                "decrypted by enumeration, recipient info did not route here"
            );
            return Ok(plaintext);
        }
        if let Ok(plaintext) = cms.decrypt_without_cert_check(&token.key) {
            warn!(
                slot = label,
                token = %token.name,
                "decrypted by enumeration without recipient check"
            );
            return Ok(plaintext);
        }
    }
    Err(KeeperError::NoKey(label.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn seal_open_round_trip_is_binary_safe() {
        let dir = tempfile::tempdir().unwrap();
        let token = testutil::generate_token(dir.path(), "rt", -60);
        let catalog = TokenCatalog::from_tokens(vec![token]);

        let mut value: Vec<u8> = (0u8..=255).collect();
        value.extend_from_slice(b"\r\n\0 trailing");

        let pem = seal(catalog.select_for_encrypt().unwrap(), &value).unwrap();
        assert!(pem.starts_with(b"-----BEGIN CMS-----"));
        assert_eq!(open(&catalog, &pem, "blob").unwrap(), value);
    }

    #[test]
    fn recipient_info_names_the_encrypting_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let token = testutil::generate_token(dir.path(), "rid", -60);
        let issuer_serial = token.issuer_serial.clone();
        let catalog = TokenCatalog::from_tokens(vec![token]);

        let pem = seal(catalog.select_for_encrypt().unwrap(), b"x").unwrap();
        let der_bytes = CmsContentInfo::from_pem(&pem).unwrap().to_der().unwrap();
        let recipients = der::cms_recipient_ids(&der_bytes).unwrap();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].issuer, issuer_serial.0);
        assert_eq!(recipients[0].serial, issuer_serial.1);
    }

    #[test]
    fn rotation_keeps_old_envelopes_readable() {
        let dir = tempfile::tempdir().unwrap();
        let material = testutil::generate_cert("old", -86_400 * 365);
        let (cert_path, key_path) = testutil::write_pem_files(dir.path(), "old", &material);
        let old_writer =
            crate::token::Token::load("old", &cert_path, &key_path, None).unwrap();
        let old_reader =
            crate::token::Token::load("old", &cert_path, &key_path, None).unwrap();
        let new = testutil::generate_token(dir.path(), "new", -60);
        let new_fp = new.info.fingerprint.clone();

        // Envelope written while the old token was the only one configured.
        let legacy_pem = seal(&old_writer, b"legacy secret").unwrap();

        // After rotation the newer token takes over encryption...
        let catalog = TokenCatalog::from_tokens(vec![old_reader, new]);
        assert_eq!(
            catalog.select_for_encrypt().unwrap().info.fingerprint,
            new_fp
        );
        let fresh_pem = seal(catalog.select_for_encrypt().unwrap(), b"fresh secret").unwrap();
        assert_eq!(open(&catalog, &fresh_pem, "fresh").unwrap(), b"fresh secret");

        // ...while recipient routing still lands old envelopes on the old
        // token.
        assert_eq!(
            open(&catalog, &legacy_pem, "legacy").unwrap(),
            b"legacy secret"
        );
    }

    #[test]
    fn enumeration_recovers_when_routing_cannot() {
        let dir = tempfile::tempdir().unwrap();
        let token = testutil::generate_token(dir.path(), "fallback", -60);
        let mut catalog = TokenCatalog::from_tokens(vec![token]);
        let pem = seal(catalog.select_for_encrypt().unwrap(), b"covert").unwrap();

        // Empty the issuer/serial index: routing misses, enumeration over
        // the fingerprint index still opens the envelope.
        catalog.clear_recipient_index();
        assert_eq!(open(&catalog, &pem, "covert").unwrap(), b"covert");
    }

    #[test]
    fn unrelated_token_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let writer = testutil::generate_token(dir.path(), "writer", -60);
        let reader = testutil::generate_token(dir.path(), "reader", -60);

        let pem = seal(&writer, b"private").unwrap();
        let catalog = TokenCatalog::from_tokens(vec![reader]);
        assert!(matches!(
            open(&catalog, &pem, "private"),
            Err(KeeperError::NoKey(_))
        ));
    }
}
