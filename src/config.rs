//! Configuration loading and resolution.
//!
//! The config file is two-level TOML. String values may reference other
//! values as `$(section.key)` or `$(key)` (top level); references are
//! substituted repeatedly until nothing changes, and anything still
//! unresolved after that is an error. The only dynamic values the daemon
//! accepts are the declared octal hooks (`server.socket_mode`,
//! `storage.umask`); textual code values are rejected at load time.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use toml::Value;

use crate::error::{KeeperError, Result};

const MAX_RESOLVE_PASSES: usize = 20;
const DEFAULT_MAX_SERVERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Preload,
    Memcache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    Console,
    Syslog,
}

/// `crypto.token` accepts a single section name or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn names(&self) -> Vec<String> {
        match self {
            OneOrMany::One(name) => vec![name.clone()],
            OneOrMany::Many(names) => names.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CryptoSection {
    /// Path to an external openssl binary. Accepted for compatibility and
    /// logged; the crypto backend is the linked library.
    pub openssl: Option<PathBuf>,
    /// Base directory for relative certificate/key paths.
    pub base_dir: Option<PathBuf>,
    pub token: Option<OneOrMany>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub socket_file: PathBuf,
    /// Octal string, applied to the socket after bind.
    pub socket_mode: Option<String>,
    #[serde(default = "default_max_servers")]
    pub max_servers: usize,
    pub pid_file: Option<PathBuf>,
    /// Informational drop-privileges targets.
    pub user: Option<String>,
    pub group: Option<String>,
}

fn default_max_servers() -> usize {
    DEFAULT_MAX_SERVERS
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub dir: PathBuf,
    /// Octal string masking the mode of created slot files.
    pub umask: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemcacheSection {
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Both verbs are denied unless explicitly enabled.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AccessSection {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub namespace: Option<String>,
    #[serde(default = "default_cache_strategy")]
    pub cache_strategy: CacheStrategy,
    #[serde(default = "default_log_target")]
    pub log: LogTarget,
    #[serde(default)]
    pub crypto: CryptoSection,
    pub server: ServerSection,
    pub storage: StorageSection,
    #[serde(default)]
    pub memcache: MemcacheSection,
    #[serde(default)]
    pub access: AccessSection,
}

fn default_cache_strategy() -> CacheStrategy {
    CacheStrategy::Preload
}

fn default_log_target() -> LogTarget {
    LogTarget::Console
}

/// One `[section]` of token material, resolved against `crypto.base_dir`.
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub name: String,
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub passphrase: Option<SecretString>,
}

#[derive(Debug)]
pub struct Config {
    pub app: AppConfig,
    /// Scoping identifier for cache keys and logs.
    pub namespace: String,
    pub tokens: Vec<TokenSettings>,
    /// The fully resolved tree, kept for `--dumpconfig`.
    raw: Value,
}

impl Config {
    /// Load, resolve references, and type-check a config file.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            KeeperError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut value: Value = toml::from_str(&text)
            .map_err(|e| KeeperError::Config(format!("config parse failed: {e}")))?;

        reject_dynamic_values(&value)?;
        resolve_references(&mut value)?;

        let app = AppConfig::deserialize(value.clone())
            .map_err(|e| KeeperError::Config(format!("config schema error: {e}")))?;
        let tokens = extract_tokens(&value, &app.crypto)?;

        let namespace = app.namespace.clone().unwrap_or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("skeepd")
                .to_string()
        });

        Ok(Config {
            app,
            namespace,
            tokens,
            raw: value,
        })
    }

    pub fn socket_mode(&self) -> Result<Option<u32>> {
        self.app
            .server
            .socket_mode
            .as_deref()
            .map(|s| parse_octal("server.socket_mode", s))
            .transpose()
    }

    pub fn storage_umask(&self) -> Result<Option<u32>> {
        self.app
            .storage
            .umask
            .as_deref()
            .map(|s| parse_octal("storage.umask", s))
            .transpose()
    }

    /// `server.pid_file`, defaulting to `<socket_file>.pid`.
    pub fn pid_file(&self) -> PathBuf {
        self.app.server.pid_file.clone().unwrap_or_else(|| {
            let mut path = self.app.server.socket_file.clone().into_os_string();
            path.push(".pid");
            PathBuf::from(path)
        })
    }

    /// The resolved configuration rendered back as TOML.
    pub fn dump(&self) -> String {
        toml::to_string_pretty(&self.raw).unwrap_or_default()
    }
}

/// Parse an octal mode/umask string such as `0660` or `0o077`.
fn parse_octal(what: &str, text: &str) -> Result<u32> {
    let digits = text.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .map_err(|_| KeeperError::Config(format!("{what}: '{text}' is not an octal mode")))
}

/// The source system allowed arbitrary code as config values. Here the
/// declared hooks are the whole dynamic surface; anything shaped like a
/// closure is refused up front.
fn reject_dynamic_values(value: &Value) -> Result<()> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim_start();
            if trimmed.starts_with("sub {") || trimmed.starts_with("sub{") {
                return Err(KeeperError::Config(
                    "dynamic code values are not supported; use the declared hooks".into(),
                ));
            }
            Ok(())
        }
        Value::Table(table) => table.values().try_for_each(reject_dynamic_values),
        Value::Array(items) => items.iter().try_for_each(reject_dynamic_values),
        _ => Ok(()),
    }
}

fn resolve_references(root: &mut Value) -> Result<()> {
    for _ in 0..MAX_RESOLVE_PASSES {
        let snapshot = root.clone();
        let mut changed = false;
        substitute(root, &snapshot, &mut changed)?;
        if !changed {
            return check_resolved(root);
        }
    }
    Err(KeeperError::Config(
        "config references did not reach a fixed point (reference cycle?)".into(),
    ))
}

fn substitute(value: &mut Value, root: &Value, changed: &mut bool) -> Result<()> {
    match value {
        Value::String(s) => {
            let expanded = expand(s, root)?;
            if expanded != *s {
                *s = expanded;
                *changed = true;
            }
            Ok(())
        }
        Value::Table(table) => table
            .iter_mut()
            .try_for_each(|(_, v)| substitute(v, root, changed)),
        Value::Array(items) => items
            .iter_mut()
            .try_for_each(|v| substitute(v, root, changed)),
        _ => Ok(()),
    }
}

/// Replace every complete `$(name)` span in one pass. Unknown references
/// are left literal so the fixed-point check can report them.
fn expand(text: &str, root: &Value) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find(')') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        match lookup(name, root)? {
            Some(replacement) => out.push_str(&replacement),
            None => {
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// `section.key` or `key` (top level). Only scalar targets make sense in a
/// string substitution.
fn lookup(name: &str, root: &Value) -> Result<Option<String>> {
    let target = match name.split_once('.') {
        Some((section, key)) => root.get(section).and_then(|s| s.get(key)),
        None => root.get(name),
    };
    match target {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Integer(n)) => Ok(Some(n.to_string())),
        Some(Value::Float(f)) => Ok(Some(f.to_string())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(KeeperError::Config(format!(
            "reference $({name}) points at a non-scalar value"
        ))),
    }
}

fn check_resolved(value: &Value) -> Result<()> {
    match value {
        Value::String(s) if s.contains("$(") => Err(KeeperError::Config(format!(
            "unresolved reference in '{s}'"
        ))),
        Value::Table(table) => table.values().try_for_each(check_resolved),
        Value::Array(items) => items.iter().try_for_each(check_resolved),
        _ => Ok(()),
    }
}

/// Pull the token sections named by `crypto.token` out of the resolved
/// tree. A named section missing its certificate or key entry is a config
/// error; parse failures of the material itself surface later as token
/// load errors.
fn extract_tokens(root: &Value, crypto: &CryptoSection) -> Result<Vec<TokenSettings>> {
    let Some(token_names) = crypto.token.as_ref() else {
        return Ok(Vec::new());
    };

    let mut tokens = Vec::new();
    for name in token_names.names() {
        let section = root
            .get(&name)
            .and_then(Value::as_table)
            .ok_or_else(|| KeeperError::Config(format!("token section [{name}] is missing")))?;

        let certificate = section
            .get("certificate")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                KeeperError::Config(format!("token section [{name}] has no certificate"))
            })?;
        let key = section
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| KeeperError::Config(format!("token section [{name}] has no key")))?;
        let passphrase = section
            .get("passphrase")
            .and_then(Value::as_str)
            .map(|s| SecretString::new(s.to_string()));

        tokens.push(TokenSettings {
            name: name.clone(),
            certificate: anchor(crypto.base_dir.as_deref(), certificate),
            key: anchor(crypto.base_dir.as_deref(), key),
            passphrase,
        });
    }
    Ok(tokens)
}

/// Relative certificate/key paths resolve against `crypto.base_dir`.
fn anchor(base_dir: Option<&Path>, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    const MINIMAL: &str = r#"
[server]
socket_file = "/run/skeepd/socket"

[storage]
dir = "/var/lib/skeepd"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let (_dir, path) = write_config(MINIMAL);
        let config = Config::load(&path).unwrap();

        assert_eq!(config.namespace, "vault");
        assert_eq!(config.app.cache_strategy, CacheStrategy::Preload);
        assert_eq!(config.app.log, LogTarget::Console);
        assert_eq!(config.app.server.max_servers, 5);
        assert!(!config.app.access.read);
        assert!(!config.app.access.write);
        assert!(config.tokens.is_empty());
        assert_eq!(
            config.pid_file(),
            PathBuf::from("/run/skeepd/socket.pid")
        );
        assert_eq!(config.socket_mode().unwrap(), None);
    }

    #[test]
    fn references_resolve_transitively() {
        let (_dir, path) = write_config(
            r#"
namespace = "prod"
base = "/etc/skeepd"

[crypto]
base_dir = "$(base)"
token = "rsa1"

[rsa1]
certificate = "$(crypto.base_dir)/rsa1.crt"
key = "rsa1.key"

[server]
socket_file = "$(base)/socket"

[storage]
dir = "$(base)/storage"

[access]
read = true
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.namespace, "prod");
        assert_eq!(
            config.app.server.socket_file,
            PathBuf::from("/etc/skeepd/socket")
        );
        assert_eq!(config.tokens.len(), 1);
        assert_eq!(
            config.tokens[0].certificate,
            PathBuf::from("/etc/skeepd/rsa1.crt")
        );
        // Relative key path anchors at crypto.base_dir.
        assert_eq!(
            config.tokens[0].key,
            PathBuf::from("/etc/skeepd/rsa1.key")
        );
        assert!(config.app.access.read);
        assert!(!config.app.access.write);
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let (_dir, path) = write_config(
            r#"
[server]
socket_file = "$(nowhere.at_all)/socket"

[storage]
dir = "/tmp"
"#,
        );
        assert!(matches!(
            Config::load(&path),
            Err(KeeperError::Config(_))
        ));
    }

    #[test]
    fn reference_cycle_is_an_error() {
        let (_dir, path) = write_config(
            r#"
a = "$(b)x"
b = "$(a)y"

[server]
socket_file = "/tmp/s"

[storage]
dir = "/tmp"
"#,
        );
        assert!(matches!(
            Config::load(&path),
            Err(KeeperError::Config(_))
        ));
    }

    #[test]
    fn dynamic_code_values_are_rejected() {
        let (_dir, path) = write_config(
            r#"
[server]
socket_file = "/tmp/s"
socket_mode = "sub { 0666 }"

[storage]
dir = "/tmp"
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("dynamic code"));
    }

    #[test]
    fn octal_hooks_parse() {
        let (_dir, path) = write_config(
            r#"
[server]
socket_file = "/tmp/s"
socket_mode = "0660"

[storage]
dir = "/tmp"
umask = "0o077"
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.socket_mode().unwrap(), Some(0o660));
        assert_eq!(config.storage_umask().unwrap(), Some(0o077));
    }

    #[test]
    fn bad_octal_is_a_config_error() {
        let (_dir, path) = write_config(
            r#"
[server]
socket_file = "/tmp/s"
socket_mode = "rwxrwx"

[storage]
dir = "/tmp"
"#,
        );
        let config = Config::load(&path).unwrap();
        assert!(config.socket_mode().is_err());
    }

    #[test]
    fn token_section_missing_key_is_a_config_error() {
        let (_dir, path) = write_config(
            r#"
[crypto]
token = ["rsa1"]

[rsa1]
certificate = "/etc/skeepd/rsa1.crt"

[server]
socket_file = "/tmp/s"

[storage]
dir = "/tmp"
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("no key"));
    }

    #[test]
    fn token_list_and_single_string_both_work() {
        let base = r#"
[rsa1]
certificate = "/c1"
key = "/k1"

[rsa2]
certificate = "/c2"
key = "/k2"
passphrase = "hunter2"

[server]
socket_file = "/tmp/s"

[storage]
dir = "/tmp"
"#;
        let (_dir, path) = write_config(&format!("[crypto]\ntoken = \"rsa1\"\n{base}"));
        assert_eq!(Config::load(&path).unwrap().tokens.len(), 1);

        let (_dir2, path2) =
            write_config(&format!("[crypto]\ntoken = [\"rsa1\", \"rsa2\"]\n{base}"));
        let config = Config::load(&path2).unwrap();
        assert_eq!(config.tokens.len(), 2);
        assert!(config.tokens[1].passphrase.is_some());
    }

    #[test]
    fn dump_round_trips_through_toml() {
        let (_dir, path) = write_config(MINIMAL);
        let config = Config::load(&path).unwrap();
        let dumped: Value = toml::from_str(&config.dump()).unwrap();
        assert_eq!(
            dumped.get("server").and_then(|s| s.get("socket_file")),
            Some(&Value::String("/run/skeepd/socket".into()))
        );
    }
}
