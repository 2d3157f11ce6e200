//! Shared helpers for unit tests: in-process generation of self-signed RSA
//! certificates and PEM files so tests never depend on fixture material.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};

const RSA_KEY_SIZE_TEST: u32 = 2048;
const X509_VERSION_3: i32 = 2;

pub struct CertMaterial {
    pub certificate: X509,
    pub key: PKey<Private>,
}

/// Generate a self-signed certificate whose NotBefore lies
/// `not_before_offset_secs` seconds from now (negative = in the past).
pub fn generate_cert(common_name: &str, not_before_offset_secs: i64) -> CertMaterial {
    let rsa = openssl::rsa::Rsa::generate(RSA_KEY_SIZE_TEST).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(X509_VERSION_3).unwrap();

    let mut serial = BigNum::new().unwrap();
    serial.rand(63, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();

    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, common_name)
        .unwrap();
    name.append_entry_by_nid(openssl::nid::Nid::ORGANIZATIONNAME, "skeepd-tests")
        .unwrap();
    let name = name.build();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let not_before = Asn1Time::from_unix(now + not_before_offset_secs).unwrap();
    let not_after = Asn1Time::from_unix(now + not_before_offset_secs + 10 * 365 * 86_400).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();

    builder.set_pubkey(&key).unwrap();

    let bc = BasicConstraints::new().critical().build().unwrap();
    builder.append_extension(bc).unwrap();
    let ku = KeyUsage::new()
        .critical()
        .key_encipherment()
        .data_encipherment()
        .build()
        .unwrap();
    builder.append_extension(ku).unwrap();

    builder.sign(&key, MessageDigest::sha256()).unwrap();

    CertMaterial {
        certificate: builder.build(),
        key,
    }
}

/// Write certificate and key as PEM under `dir`, returning the two paths.
pub fn write_pem_files(dir: &Path, name: &str, material: &CertMaterial) -> (PathBuf, PathBuf) {
    let cert_path = dir.join(format!("{name}.crt"));
    let key_path = dir.join(format!("{name}.key"));
    std::fs::write(&cert_path, material.certificate.to_pem().unwrap()).unwrap();
    std::fs::write(&key_path, material.key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (cert_path, key_path)
}

/// Generate, write, and load a [`crate::token::Token`] in one call.
pub fn generate_token(dir: &Path, name: &str, not_before_offset_secs: i64) -> crate::token::Token {
    let material = generate_cert(name, not_before_offset_secs);
    let (cert_path, key_path) = write_pem_files(dir, name, &material);
    crate::token::Token::load(name, &cert_path, &key_path, None).unwrap()
}

/// A tiny in-process memcached speaking exactly the two verbs the daemon
/// uses. Returns the listen address and a handle to the backing table so
/// tests can tamper with stored entries.
pub fn spawn_fake_memcached() -> (String, Arc<Mutex<HashMap<String, Vec<u8>>>>) {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let table: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    let shared = Arc::clone(&table);

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let table = Arc::clone(&shared);
            std::thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut stream = stream;
                let mut line = String::new();
                if reader.read_line(&mut line).is_err() {
                    return;
                }
                let words: Vec<String> = line.trim_end().split(' ').map(str::to_string).collect();
                match words.first().map(String::as_str) {
                    Some("set") if words.len() == 5 => {
                        let len: usize = words[4].parse().unwrap();
                        let mut value = vec![0u8; len];
                        reader.read_exact(&mut value).unwrap();
                        let mut crlf = [0u8; 2];
                        reader.read_exact(&mut crlf).unwrap();
                        table.lock().unwrap().insert(words[1].clone(), value);
                        stream.write_all(b"STORED\r\n").unwrap();
                    }
                    Some("get") if words.len() == 2 => {
                        if let Some(value) = table.lock().unwrap().get(&words[1]) {
                            stream
                                .write_all(
                                    format!("VALUE {} 0 {}\r\n", words[1], value.len()).as_bytes(),
                                )
                                .unwrap();
                            stream.write_all(value).unwrap();
                            stream.write_all(b"\r\n").unwrap();
                        }
                        stream.write_all(b"END\r\n").unwrap();
                    }
                    _ => {
                        stream.write_all(b"ERROR\r\n").unwrap();
                    }
                }
            });
        }
    });
    (addr, table)
}
