//! Minimal DER cursor for the structure walks the openssl bindings do not
//! expose: CMS recipient-info enumeration, certificate issuer/serial
//! extraction, and a few extension summaries.
//!
//! This is not a general ASN.1 library. It reads tag-length-value triples
//! with bounds checking and understands exactly the shapes named below.

use crate::error::{KeeperError, Result};

/// One recipient identity from a CMS EnvelopedData structure.
///
/// `issuer` holds the raw DER of the issuer Name (full TLV), `serial` the
/// content octets of the serialNumber INTEGER. Both compare byte-for-byte
/// with the values extracted from a certificate by [`cert_issuer_serial`],
/// since OpenSSL copies the encoded issuer into the RecipientInfo verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecipientId {
    pub issuer: Vec<u8>,
    pub serial: Vec<u8>,
}

struct Tlv<'a> {
    tag: u8,
    content: &'a [u8],
    raw: &'a [u8],
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_tlv(&mut self) -> Result<Tlv<'a>> {
        let start = self.pos;
        let tag = *self
            .data
            .get(self.pos)
            .ok_or_else(|| malformed("truncated tag"))?;
        self.pos += 1;
        let first = *self
            .data
            .get(self.pos)
            .ok_or_else(|| malformed("truncated length"))?;
        self.pos += 1;
        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let n = (first & 0x7f) as usize;
            if n == 0 || n > 4 {
                return Err(malformed("unsupported length encoding"));
            }
            let bytes = self
                .data
                .get(self.pos..self.pos + n)
                .ok_or_else(|| malformed("truncated long-form length"))?;
            self.pos += n;
            bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
        };
        let content = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| malformed("content past end of input"))?;
        self.pos += len;
        Ok(Tlv {
            tag,
            content,
            raw: &self.data[start..self.pos],
        })
    }

    fn expect(&mut self, tag: u8) -> Result<Tlv<'a>> {
        let tlv = self.read_tlv()?;
        if tlv.tag != tag {
            return Err(malformed(&format!(
                "expected tag {tag:#04x}, found {:#04x}",
                tlv.tag
            )));
        }
        Ok(tlv)
    }
}

fn malformed(what: &str) -> KeeperError {
    KeeperError::Crypto(format!("malformed DER: {what}"))
}

const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_INTEGER: u8 = 0x02;
const TAG_OID: u8 = 0x06;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_BOOLEAN: u8 = 0x01;
const TAG_CTX_0: u8 = 0xa0;
const TAG_CTX_3: u8 = 0xa3;

/// id-envelopedData 1.2.840.113549.1.7.3, content octets of the OID.
const OID_ENVELOPED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x03];
/// keyUsage 2.5.29.15
const OID_KEY_USAGE: &[u8] = &[0x55, 0x1d, 0x0f];
/// issuerAltName 2.5.29.18
const OID_ISSUER_ALT_NAME: &[u8] = &[0x55, 0x1d, 0x12];
/// basicConstraints 2.5.29.19
const OID_BASIC_CONSTRAINTS: &[u8] = &[0x55, 0x1d, 0x13];

/// Enumerate the issuerAndSerialNumber recipient identities of a CMS
/// EnvelopedData blob, in the order they appear.
///
/// Recipients identified by subjectKeyIdentifier (or any non-ktri type) are
/// skipped; callers fall back to brute-force decryption for those.
pub fn cms_recipient_ids(cms_der: &[u8]) -> Result<Vec<RecipientId>> {
    let mut outer = Reader::new(cms_der);
    let content_info = outer.expect(TAG_SEQUENCE)?;

    let mut ci = Reader::new(content_info.content);
    let oid = ci.expect(TAG_OID)?;
    if oid.content != OID_ENVELOPED_DATA {
        return Err(malformed("not a CMS EnvelopedData structure"));
    }
    let explicit = ci.expect(TAG_CTX_0)?;

    let mut env = Reader::new(explicit.content);
    let enveloped = env.expect(TAG_SEQUENCE)?;

    let mut ed = Reader::new(enveloped.content);
    ed.expect(TAG_INTEGER)?; // CMSVersion
    if ed.peek_tag() == Some(TAG_CTX_0) {
        ed.read_tlv()?; // originatorInfo, not needed
    }
    let recipient_set = ed.expect(TAG_SET)?;

    let mut ids = Vec::new();
    let mut recipients = Reader::new(recipient_set.content);
    while !recipients.done() {
        let info = recipients.read_tlv()?;
        // KeyTransRecipientInfo is a bare SEQUENCE; every other recipient
        // type is context-tagged.
        if info.tag != TAG_SEQUENCE {
            continue;
        }
        let mut ktri = Reader::new(info.content);
        ktri.expect(TAG_INTEGER)?; // version
        if ktri.peek_tag() != Some(TAG_SEQUENCE) {
            continue; // rid is a subjectKeyIdentifier
        }
        let ias = ktri.expect(TAG_SEQUENCE)?;
        let mut pair = Reader::new(ias.content);
        let issuer = pair.expect(TAG_SEQUENCE)?;
        let serial = pair.expect(TAG_INTEGER)?;
        ids.push(RecipientId {
            issuer: issuer.raw.to_vec(),
            serial: serial.content.to_vec(),
        });
    }
    Ok(ids)
}

/// Extract the issuer Name (raw TLV) and serialNumber (content octets) from
/// a certificate's DER encoding.
pub fn cert_issuer_serial(cert_der: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut outer = Reader::new(cert_der);
    let certificate = outer.expect(TAG_SEQUENCE)?;

    let mut cert = Reader::new(certificate.content);
    let tbs = cert.expect(TAG_SEQUENCE)?;

    let mut fields = Reader::new(tbs.content);
    if fields.peek_tag() == Some(TAG_CTX_0) {
        fields.read_tlv()?; // [0] EXPLICIT version
    }
    let serial = fields.expect(TAG_INTEGER)?;
    fields.expect(TAG_SEQUENCE)?; // signature AlgorithmIdentifier
    let issuer = fields.expect(TAG_SEQUENCE)?;
    Ok((issuer.raw.to_vec(), serial.content.to_vec()))
}

/// Locate an extension by OID in a certificate and return the extnValue
/// octets (the DER inside the OCTET STRING wrapper).
fn cert_extension(cert_der: &[u8], oid: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut outer = Reader::new(cert_der);
    let certificate = outer.expect(TAG_SEQUENCE)?;

    let mut cert = Reader::new(certificate.content);
    let tbs = cert.expect(TAG_SEQUENCE)?;

    let mut fields = Reader::new(tbs.content);
    // Walk to the [3] EXPLICIT Extensions field, skipping everything else.
    while !fields.done() {
        let tlv = fields.read_tlv()?;
        if tlv.tag != TAG_CTX_3 {
            continue;
        }
        let mut wrapper = Reader::new(tlv.content);
        let list = wrapper.expect(TAG_SEQUENCE)?;
        let mut exts = Reader::new(list.content);
        while !exts.done() {
            let ext = exts.expect(TAG_SEQUENCE)?;
            let mut e = Reader::new(ext.content);
            let ext_oid = e.expect(TAG_OID)?;
            if e.peek_tag() == Some(TAG_BOOLEAN) {
                e.read_tlv()?; // critical flag
            }
            let value = e.expect(TAG_OCTET_STRING)?;
            if ext_oid.content == oid {
                return Ok(Some(value.content.to_vec()));
            }
        }
        return Ok(None);
    }
    Ok(None)
}

const KEY_USAGE_NAMES: [&str; 9] = [
    "Digital Signature",
    "Non Repudiation",
    "Key Encipherment",
    "Data Encipherment",
    "Key Agreement",
    "Certificate Sign",
    "CRL Sign",
    "Encipher Only",
    "Decipher Only",
];

/// Render the keyUsage extension as a comma-separated summary, or None when
/// the certificate does not carry one.
pub fn key_usage_summary(cert_der: &[u8]) -> Result<Option<String>> {
    let Some(ext) = cert_extension(cert_der, OID_KEY_USAGE)? else {
        return Ok(None);
    };
    let mut reader = Reader::new(&ext);
    let bits = reader.expect(TAG_BIT_STRING)?;
    let Some((_unused, bytes)) = bits.content.split_first() else {
        return Err(malformed("empty keyUsage bit string"));
    };
    let mut names = Vec::new();
    for (i, name) in KEY_USAGE_NAMES.iter().enumerate() {
        let byte = i / 8;
        let mask = 0x80u8 >> (i % 8);
        if bytes.get(byte).is_some_and(|b| b & mask != 0) {
            names.push(*name);
        }
    }
    Ok(Some(names.join(", ")))
}

/// Render the basicConstraints extension in the openssl text style,
/// e.g. `CA:TRUE, pathlen:0`.
pub fn basic_constraints_summary(cert_der: &[u8]) -> Result<Option<String>> {
    let Some(ext) = cert_extension(cert_der, OID_BASIC_CONSTRAINTS)? else {
        return Ok(None);
    };
    let mut reader = Reader::new(&ext);
    let seq = reader.expect(TAG_SEQUENCE)?;
    let mut fields = Reader::new(seq.content);
    let mut ca = false;
    let mut pathlen = None;
    if fields.peek_tag() == Some(TAG_BOOLEAN) {
        let flag = fields.read_tlv()?;
        ca = flag.content.first().is_some_and(|b| *b != 0);
    }
    if fields.peek_tag() == Some(TAG_INTEGER) {
        let n = fields.read_tlv()?;
        pathlen = Some(
            n.content
                .iter()
                .fold(0u64, |acc, b| (acc << 8) | *b as u64),
        );
    }
    let mut out = format!("CA:{}", if ca { "TRUE" } else { "FALSE" });
    if let Some(n) = pathlen {
        out.push_str(&format!(", pathlen:{n}"));
    }
    Ok(Some(out))
}

/// Render the issuerAltName general names the openssl way
/// (`DNS:…`, `email:…`, `URI:…`); entries of other kinds are skipped.
pub fn issuer_alt_names(cert_der: &[u8]) -> Result<Option<Vec<String>>> {
    let Some(ext) = cert_extension(cert_der, OID_ISSUER_ALT_NAME)? else {
        return Ok(None);
    };
    let mut reader = Reader::new(&ext);
    let seq = reader.expect(TAG_SEQUENCE)?;
    let mut names = Vec::new();
    let mut entries = Reader::new(seq.content);
    while !entries.done() {
        let name = entries.read_tlv()?;
        let rendered = match name.tag {
            0x81 => Some(("email", name.content)),
            0x82 => Some(("DNS", name.content)),
            0x86 => Some(("URI", name.content)),
            _ => None,
        };
        if let Some((kind, bytes)) = rendered {
            if let Ok(text) = std::str::from_utf8(bytes) {
                names.push(format!("{kind}:{text}"));
            }
        }
    }
    Ok(Some(names))
}
