//! Recipient tokens: an X.509 certificate plus the matching private key.
//!
//! A token is the unit the catalogue manages. Loading a token parses the
//! certificate into a [`CertInfo`] with every field normalized the same way
//! regardless of what the certificate looks like on disk, so the rest of the
//! daemon can index and compare tokens without touching OpenSSL types.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::NaiveDateTime;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509NameRef, X509};
use secrecy::{ExposeSecret, SecretString};

use crate::der;
use crate::error::{KeeperError, Result};

/// Normalized certificate fields.
///
/// All values are plain strings so they can be logged, compared, and carried
/// across reloads without holding OpenSSL handles.
#[derive(Debug, Clone)]
pub struct CertInfo {
    /// X.509 version as displayed (v3 certificates report 3).
    pub version: i64,
    /// Subject DN, `KEY=value, ...` form.
    pub subject_name: String,
    /// Issuer DN, `KEY=value, ...` form.
    pub issuer_name: String,
    /// Serial as colon-separated upper-case hex with an even digit count.
    pub serial_number: String,
    /// Serial as a decimal string (serials may exceed machine integers).
    pub serial: String,
    /// `YYYYMMDDHHMMSS`
    pub not_before: String,
    /// `YYYYMMDDHHMMSS`
    pub not_after: String,
    /// Base64 of the SubjectPublicKeyInfo DER.
    pub public_key: String,
    /// Base64 of the full certificate DER.
    pub certificate: String,
    /// SHA-1 digest, colon-separated upper-case hex.
    pub fingerprint: String,
    pub subject_alt_name: Option<Vec<String>>,
    pub issuer_alt_name: Option<Vec<String>>,
    pub basic_constraints: Option<String>,
    pub subject_key_identifier: Option<String>,
    pub authority_key_identifier: Option<String>,
    pub crl_distribution_points: Option<Vec<String>>,
    pub key_usage: Option<String>,
}

/// A recipient identity usable for encryption and/or decryption.
pub struct Token {
    /// Config section name this token was loaded from.
    pub name: String,
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
    passphrase: Option<SecretString>,
    pub certificate: X509,
    pub key: PKey<Private>,
    pub info: CertInfo,
    /// (issuer Name DER, serial content octets): the catalogue index key,
    /// byte-compatible with CMS issuerAndSerialNumber recipient infos.
    pub issuer_serial: (Vec<u8>, Vec<u8>),
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("name", &self.name)
            .field("fingerprint", &self.info.fingerprint)
            .field("subject", &self.info.subject_name)
            .finish()
    }
}

impl Token {
    /// Load a token from certificate and key PEM files.
    ///
    /// Unreadable or unparseable material, or a certificate that violates
    /// the CertInfo invariants, surfaces as [`KeeperError::TokenLoad`].
    pub fn load(
        name: &str,
        certificate_path: &Path,
        key_path: &Path,
        passphrase: Option<SecretString>,
    ) -> Result<Token> {
        let cert_pem = std::fs::read(certificate_path).map_err(|e| {
            KeeperError::TokenLoad(format!(
                "token '{name}': cannot read certificate {}: {e}",
                certificate_path.display()
            ))
        })?;
        let certificate = X509::from_pem(&cert_pem).map_err(|e| {
            KeeperError::TokenLoad(format!("token '{name}': certificate parse failed: {e}"))
        })?;

        let key_pem = std::fs::read(key_path).map_err(|e| {
            KeeperError::TokenLoad(format!(
                "token '{name}': cannot read key {}: {e}",
                key_path.display()
            ))
        })?;
        let key = match &passphrase {
            Some(secret) => PKey::private_key_from_pem_passphrase(
                &key_pem,
                secret.expose_secret().as_bytes(),
            ),
            None => PKey::private_key_from_pem(&key_pem),
        }
        .map_err(|e| {
            KeeperError::TokenLoad(format!("token '{name}': private key parse failed: {e}"))
        })?;

        let info = parse_cert_info(&certificate)
            .map_err(|e| KeeperError::TokenLoad(format!("token '{name}': {e}")))?;

        let cert_der = certificate.to_der()?;
        let issuer_serial = der::cert_issuer_serial(&cert_der)
            .map_err(|e| KeeperError::TokenLoad(format!("token '{name}': {e}")))?;

        Ok(Token {
            name: name.to_string(),
            certificate_path: certificate_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            passphrase,
            certificate,
            key,
            info,
            issuer_serial,
        })
    }

    /// Whether a passphrase was configured for the private key.
    pub fn has_passphrase(&self) -> bool {
        self.passphrase.is_some()
    }
}

/// Parse a certificate into normalized [`CertInfo`] fields.
pub fn parse_cert_info(cert: &X509) -> Result<CertInfo> {
    let cert_der = cert.to_der()?;

    let serial_bn = cert.serial_number().to_bn()?;
    if serial_bn.is_negative() {
        return Err(KeeperError::TokenLoad("negative serial number".into()));
    }

    let not_before = normalize_asn1_time(&cert.not_before().to_string())?;
    let not_after = normalize_asn1_time(&cert.not_after().to_string())?;
    if not_before > not_after {
        return Err(KeeperError::TokenLoad(format!(
            "NotBefore {not_before} is after NotAfter {not_after}"
        )));
    }

    let public_key = cert
        .public_key()
        .map_err(|e| KeeperError::TokenLoad(format!("no public key: {e}")))?;

    let fingerprint = colon_hex(cert.digest(MessageDigest::sha1())?.as_ref());

    let subject_alt_name = cert.subject_alt_names().map(|names| {
        names
            .iter()
            .filter_map(|name| {
                if let Some(dns) = name.dnsname() {
                    Some(format!("DNS:{dns}"))
                } else if let Some(email) = name.email() {
                    Some(format!("email:{email}"))
                } else if let Some(uri) = name.uri() {
                    Some(format!("URI:{uri}"))
                } else {
                    name.ipaddress().map(|ip| format!("IP:{}", render_ip(ip)))
                }
            })
            .collect::<Vec<_>>()
    });

    let crl_distribution_points = cert.crl_distribution_points().map(|points| {
        points
            .iter()
            .filter_map(|dp| dp.distpoint())
            .filter_map(|name| name.fullname())
            .flat_map(|names| {
                names
                    .iter()
                    .filter_map(|gn| gn.uri().map(|uri| format!("URI:{uri}")))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
    });

    Ok(CertInfo {
        version: i64::from(cert.version()) + 1,
        subject_name: normalize_name(cert.subject_name()),
        issuer_name: normalize_name(cert.issuer_name()),
        serial_number: serial_colon_hex(&serial_bn.to_hex_str()?),
        serial: serial_bn.to_dec_str()?.to_string(),
        not_before,
        not_after,
        public_key: BASE64.encode(public_key.public_key_to_der()?),
        certificate: BASE64.encode(&cert_der),
        fingerprint,
        subject_alt_name,
        issuer_alt_name: der::issuer_alt_names(&cert_der)?,
        basic_constraints: der::basic_constraints_summary(&cert_der)?,
        subject_key_identifier: cert
            .subject_key_id()
            .map(|id| colon_hex(id.as_slice())),
        authority_key_identifier: cert
            .authority_key_id()
            .map(|id| colon_hex(id.as_slice())),
        crl_distribution_points,
        key_usage: der::key_usage_summary(&cert_der)?,
    })
}

/// Render a DN as `KEY=value, ...`, entry order preserved.
fn normalize_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry
                .object()
                .nid()
                .short_name()
                .unwrap_or("UNDEF")
                .to_string();
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// OpenSSL renders ASN.1 times as `Feb  3 12:30:45 2026 GMT`; normalize to
/// the 14-digit `YYYYMMDDHHMMSS` form used for ordering and display.
fn normalize_asn1_time(text: &str) -> Result<String> {
    let trimmed = text.trim().trim_end_matches(" GMT");
    let parsed = NaiveDateTime::parse_from_str(trimmed, "%b %e %H:%M:%S %Y")
        .map_err(|e| KeeperError::TokenLoad(format!("unparseable time '{text}': {e}")))?;
    Ok(parsed.format("%Y%m%d%H%M%S").to_string())
}

/// Upper-case colon-separated hex of raw bytes (fingerprints, key ids).
fn colon_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

/// Serial hex from BN comes without padding; force an even digit count and
/// insert colons every octet.
fn serial_colon_hex(hex: &str) -> String {
    let upper = hex.to_uppercase();
    let padded = if upper.len() % 2 == 0 {
        upper
    } else {
        format!("0{upper}")
    };
    padded
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

fn render_ip(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => bytes
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join("."),
        _ => colon_hex(bytes),
    }
}
