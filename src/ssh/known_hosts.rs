//! Known hosts management for SSH host key verification
//!
//! Reads an OpenSSH `known_hosts` file into an immutable in-memory matcher and
//! appends newly trusted keys to it. The file is never rewritten in place.
//!
//! Supported line syntax:
//!
//! ```text
//! [@revoked|@cert-authority] pattern[,pattern...] key-type base64-key [comment]
//! ```
//!
//! where a pattern is a hostname, `[host]:port`, a wildcard (`*`, `?`), a
//! negation (`!pattern`) or a hashed name (`|1|salt|hmac`).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use glob::{MatchOptions, Pattern};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_SSH_PORT: u16 = 22;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Host has recorded keys and none of them is the presented one (potential MITM)
    Changed {
        expected_fingerprints: Vec<String>,
        actual_fingerprint: String,
    },
    /// Presented key is listed under `@revoked`
    Revoked { fingerprint: String },
}

/// A public host key as written in known_hosts: algorithm name plus base64 blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    key_type: String,
    key_data: String,
}

impl HostKey {
    pub fn new(key_type: impl Into<String>, key_data: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
            key_data: key_data.into(),
        }
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            key_type: key.algorithm().as_str().to_string(),
            key_data: BASE64.encode(key.public_key_bytes()),
        }
    }

    /// Parse the `key-type base64-key [comment]` tail of a known_hosts or .pub line
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let key_type = parts.next()?;
        let key_data = parts.next()?;
        if BASE64.decode(key_data).is_err() {
            return None;
        }
        Some(Self::new(key_type, key_data))
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn key_data(&self) -> &str {
        &self.key_data
    }

    /// OpenSSH style SHA256 fingerprint (`SHA256:<unpadded base64>`)
    pub fn fingerprint(&self) -> String {
        match BASE64.decode(&self.key_data) {
            Ok(bytes) => {
                let hash = Sha256::digest(&bytes);
                format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
            }
            Err(_) => "unknown".to_string(),
        }
    }
}

/// Normalize `host`/`port` the way known_hosts records them:
/// bare lowercase host for port 22, `[host]:port` otherwise.
pub fn normalize_host(host: &str, port: u16) -> String {
    let host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase();
    if port == DEFAULT_SSH_PORT {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Normalized forms under which a host is looked up and recorded:
/// the configured hostname first, then the resolved address when it differs.
pub fn host_candidates(host: &str, port: u16, remote: Option<SocketAddr>) -> Vec<String> {
    let mut candidates = vec![normalize_host(host, port)];
    if let Some(addr) = remote {
        let by_addr = normalize_host(&addr.ip().to_string(), addr.port());
        if !candidates.contains(&by_addr) {
            candidates.push(by_addr);
        }
    }
    candidates
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Revoked,
    CertAuthority,
}

#[derive(Debug, Clone)]
enum HostPattern {
    Plain {
        negated: bool,
        literal: String,
        wildcard: Option<Pattern>,
    },
    Hashed {
        salt: Vec<u8>,
        hash: Vec<u8>,
    },
}

impl HostPattern {
    fn parse(raw: &str) -> Option<Self> {
        if let Some(hashed) = raw.strip_prefix("|1|") {
            let (salt, hash) = hashed.split_once('|')?;
            return Some(HostPattern::Hashed {
                salt: BASE64.decode(salt).ok()?,
                hash: BASE64.decode(hash).ok()?,
            });
        }

        let (negated, body) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if body.is_empty() {
            return None;
        }

        let literal = body.to_lowercase();
        let wildcard = if literal.contains('*') || literal.contains('?') {
            // `[` and `]` are literal in known_hosts but glob metacharacters
            let mut escaped = String::with_capacity(literal.len() + 8);
            for c in literal.chars() {
                match c {
                    '[' => escaped.push_str("[[]"),
                    ']' => escaped.push_str("[]]"),
                    _ => escaped.push(c),
                }
            }
            Some(Pattern::new(&escaped).ok()?)
        } else {
            None
        };

        Some(HostPattern::Plain {
            negated,
            literal,
            wildcard,
        })
    }

    fn is_negated(&self) -> bool {
        matches!(self, HostPattern::Plain { negated: true, .. })
    }

    /// `host` must already be normalized
    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Plain {
                literal, wildcard, ..
            } => match wildcard {
                Some(pattern) => pattern.matches_with(
                    host,
                    MatchOptions {
                        case_sensitive: false,
                        require_literal_separator: false,
                        require_literal_leading_dot: false,
                    },
                ),
                None => literal == host,
            },
            HostPattern::Hashed { salt, hash } => match HmacSha1::new_from_slice(salt) {
                Ok(mut mac) => {
                    mac.update(host.as_bytes());
                    mac.verify_slice(hash).is_ok()
                }
                Err(_) => false,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct KnownHostLine {
    marker: Option<Marker>,
    patterns: Vec<HostPattern>,
    key: HostKey,
}

impl KnownHostLine {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (marker, rest) = if let Some(rest) = line.strip_prefix("@revoked") {
            (Some(Marker::Revoked), rest.trim_start())
        } else if let Some(rest) = line.strip_prefix("@cert-authority") {
            (Some(Marker::CertAuthority), rest.trim_start())
        } else {
            (None, line)
        };

        let (hosts, key) = rest.split_once(char::is_whitespace)?;
        let key = HostKey::parse(key)?;
        let patterns: Vec<HostPattern> = hosts.split(',').filter_map(HostPattern::parse).collect();
        if patterns.is_empty() {
            return None;
        }

        Some(Self {
            marker,
            patterns,
            key,
        })
    }

    /// A line applies when some positive pattern matches and no negated one does
    fn matches_host(&self, host: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if pattern.matches(host) {
                if pattern.is_negated() {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }
}

/// Immutable snapshot of a parsed known_hosts file
#[derive(Debug, Default)]
struct HostKeyMatcher {
    lines: Vec<KnownHostLine>,
}

impl HostKeyMatcher {
    fn parse(content: &str) -> Self {
        let mut lines = Vec::new();
        for (idx, raw) in content.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match KnownHostLine::parse(trimmed) {
                Some(line) => lines.push(line),
                None => debug!("Skipping malformed known_hosts line {}", idx + 1),
            }
        }
        Self { lines }
    }

    fn applicable<'a>(
        &'a self,
        candidates: &'a [String],
    ) -> impl Iterator<Item = &'a KnownHostLine> + 'a {
        self.lines
            .iter()
            .filter(move |line| candidates.iter().any(|c| line.matches_host(c)))
    }

    fn keys_for(&self, candidates: &[String]) -> Vec<HostKey> {
        let mut keys: Vec<HostKey> = Vec::new();
        for line in self.applicable(candidates) {
            if line.marker.is_none() && !keys.contains(&line.key) {
                keys.push(line.key.clone());
            }
        }
        keys
    }

    fn check(&self, candidates: &[String], key: &HostKey) -> HostKeyVerification {
        let fingerprint = key.fingerprint();

        if self
            .applicable(candidates)
            .any(|line| line.marker == Some(Marker::Revoked) && &line.key == key)
        {
            return HostKeyVerification::Revoked { fingerprint };
        }

        let known = self.keys_for(candidates);
        if known.is_empty() {
            HostKeyVerification::Unknown { fingerprint }
        } else if known.contains(key) {
            HostKeyVerification::Verified
        } else {
            HostKeyVerification::Changed {
                expected_fingerprints: known.iter().map(HostKey::fingerprint).collect(),
                actual_fingerprint: fingerprint,
            }
        }
    }
}

/// known_hosts backed trust store
///
/// Lookups read an `Arc` snapshot and never block on file I/O. Appends and
/// reloads are serialized by `write_lock` so a reload can never swap in a
/// snapshot older than a finished append.
pub struct KnownHostsStore {
    path: PathBuf,
    matcher: RwLock<Arc<HostKeyMatcher>>,
    write_lock: Mutex<()>,
}

/// Stores shared per path, so every verifier for one file shares one write lock
static STORES: OnceLock<DashMap<PathBuf, Arc<KnownHostsStore>>> = OnceLock::new();

impl KnownHostsStore {
    /// `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
    }

    /// Open (creating with mode 0600 if absent) and load a known_hosts file
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SshError> {
        let path = path.into();
        ensure_store_file(&path).map_err(|e| {
            SshError::TrustStoreUnavailable(format!("cannot create {}: {}", path.display(), e))
        })?;

        let store = Self {
            path,
            matcher: RwLock::new(Arc::new(HostKeyMatcher::default())),
            write_lock: Mutex::new(()),
        };
        store.reload()?;
        Ok(store)
    }

    /// Process-wide store for `path`, re-read from disk on every call
    pub fn shared(path: &Path) -> Result<Arc<Self>, SshError> {
        let stores = STORES.get_or_init(DashMap::new);
        if let Some(existing) = stores.get(path).map(|e| e.value().clone()) {
            existing.reload()?;
            return Ok(existing);
        }

        let store = Arc::new(Self::open(path)?);
        let entry = stores
            .entry(path.to_path_buf())
            .or_insert_with(|| store.clone());
        Ok(entry.value().clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file into a fresh matcher snapshot
    pub fn reload(&self) -> Result<(), SshError> {
        let _guard = self.write_lock.lock();
        self.reload_locked()
    }

    fn reload_locked(&self) -> Result<(), SshError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(SshError::TrustStoreUnavailable(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let matcher = HostKeyMatcher::parse(&content);
        debug!(
            "Loaded {} known host entries from {}",
            matcher.lines.len(),
            self.path.display()
        );
        *self.matcher.write() = Arc::new(matcher);
        Ok(())
    }

    fn snapshot(&self) -> Arc<HostKeyMatcher> {
        self.matcher.read().clone()
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        HostKey::from_public_key(key).fingerprint()
    }

    /// Verify a host's key against every normalized form of the host
    pub fn verify(
        &self,
        host: &str,
        port: u16,
        remote: Option<SocketAddr>,
        key: &HostKey,
    ) -> HostKeyVerification {
        let candidates = host_candidates(host, port, remote);
        let verification = self.snapshot().check(&candidates, key);
        debug!("Host key check for {:?}: {:?}", candidates, verification);
        verification
    }

    /// Recorded (non-revoked, non-CA) keys for a host
    pub fn keys_for_host(&self, host: &str, port: u16) -> Vec<HostKey> {
        self.snapshot().keys_for(&[normalize_host(host, port)])
    }

    /// Append `key` for a host that has no recorded key yet.
    ///
    /// Returns `Ok(true)` when a line was written, `Ok(false)` when the key was
    /// already trusted (another caller got there first). A host whose records
    /// hold a different key is refused: a mismatch is never resolved here.
    pub fn add_host(
        &self,
        host: &str,
        port: u16,
        remote: Option<SocketAddr>,
        key: &HostKey,
    ) -> Result<bool, SshError> {
        let _guard = self.write_lock.lock();

        // Another process may have appended since our snapshot
        self.reload_locked()?;

        let candidates = host_candidates(host, port, remote);
        match self.snapshot().check(&candidates, key) {
            HostKeyVerification::Verified => {
                debug!("Host key for {} already recorded, not appending", candidates[0]);
                return Ok(false);
            }
            HostKeyVerification::Changed {
                expected_fingerprints,
                actual_fingerprint,
            } => {
                return Err(SshError::HostKeyChanged {
                    host: candidates[0].clone(),
                    expected: expected_fingerprints.join(", "),
                    actual: actual_fingerprint,
                    known_hosts: self.path.display().to_string(),
                });
            }
            HostKeyVerification::Revoked { fingerprint } => {
                return Err(SshError::HostKeyRevoked {
                    host: candidates[0].clone(),
                    fingerprint,
                    known_hosts: self.path.display().to_string(),
                });
            }
            HostKeyVerification::Unknown { .. } => {}
        }

        let line = format!(
            "{} {} {}",
            candidates.join(","),
            key.key_type(),
            key.key_data()
        );
        self.append_line(&line).map_err(|e| {
            SshError::TrustStoreUnavailable(format!("cannot write {}: {}", self.path.display(), e))
        })?;

        // Readers must see the new record before the caller reports success
        self.reload_locked()?;

        info!(
            "Added host key for {} (type: {}, {}) to {}",
            candidates.join(","),
            key.key_type(),
            key.fingerprint(),
            self.path.display()
        );
        Ok(true)
    }

    fn append_line(&self, line: &str) -> io::Result<()> {
        ensure_store_file(&self.path)?;

        let needs_newline = fs::read(&self.path)
            .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
            .unwrap_or(false);

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        if needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "{}", line)?;
        file.sync_all()
    }
}

/// Create the store file (and its directory) with owner-only permissions
fn ensure_store_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(parent, fs::Permissions::from_mode(0o700)) {
                    warn!("Failed to restrict permissions on {}: {}", parent.display(), e);
                }
            }
        }
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const K1: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAID3UstXbxnSOJsnSW/xlutl6a3+ZLT7VX4zY8lB9LZHG";
    const K1_FP: &str = "SHA256:UxCTRqzCfF+jbcioQcStPb3VoyYOUIbVmMhW2FeXCJM";
    const K2: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILANUChF4zmxBSiaWXIb+HC708pxwpU1HAi/yujbc8Cu";

    fn k1() -> HostKey {
        HostKey::parse(K1).unwrap()
    }

    fn k2() -> HostKey {
        HostKey::parse(K2).unwrap()
    }

    fn store_with(content: &str) -> (tempfile::TempDir, KnownHostsStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, content).unwrap();
        let store = KnownHostsStore::open(&path).unwrap();
        (dir, store)
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("GitHub.com", 22), "github.com");
        assert_eq!(normalize_host("server.example.com", 2222), "[server.example.com]:2222");
        assert_eq!(normalize_host("[10.0.0.5]", 22), "10.0.0.5");
    }

    #[test]
    fn test_fingerprint_matches_ssh_keygen() {
        assert_eq!(k1().fingerprint(), K1_FP);
    }

    #[test]
    fn test_verify_outcomes() {
        let (_dir, store) = store_with(&format!(
            "# comment\n\nbuild.example.com,10.0.0.7 {}\nnot a valid line\n",
            K1
        ));

        assert_eq!(
            store.verify("build.example.com", 22, None, &k1()),
            HostKeyVerification::Verified
        );
        assert_eq!(
            store.verify("10.0.0.7", 22, None, &k1()),
            HostKeyVerification::Verified
        );
        match store.verify("build.example.com", 22, None, &k2()) {
            HostKeyVerification::Changed {
                expected_fingerprints,
                ..
            } => assert_eq!(expected_fingerprints, vec![K1_FP.to_string()]),
            other => panic!("expected Changed, got {:?}", other),
        }
        assert!(matches!(
            store.verify("other.example.com", 22, None, &k1()),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_port_is_part_of_identity() {
        let (_dir, store) = store_with(&format!("[db.internal]:2222 {}\n", K1));
        assert_eq!(
            store.verify("db.internal", 2222, None, &k1()),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            store.verify("db.internal", 22, None, &k1()),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_remote_address_is_consulted() {
        let (_dir, store) = store_with(&format!("10.0.0.5 {}\n", K1));
        let addr: SocketAddr = "10.0.0.5:22".parse().unwrap();
        assert_eq!(
            store.verify("build.example.com", 22, Some(addr), &k1()),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            store.verify("build.example.com", 22, Some(addr), &k2()),
            HostKeyVerification::Changed { .. }
        ));
    }

    #[test]
    fn test_hashed_hostnames() {
        let (_dir, store) = store_with(&format!(
            "|1|dZ5v0gSuGpNiIAX3tkB0xyvCnwc=|8N3OB4fEGjRc/AmgcIj5BSo7eAM= {}\n\
             |1|HgrM8SenanGik5YOPVuV9N/kqQ0=|Y/FH8DHmdxA/Mo5L8xVx0K/HM1Q= {}\n",
            K1, K2
        ));
        assert_eq!(
            store.verify("10.0.0.9", 22, None, &k1()),
            HostKeyVerification::Verified
        );
        assert_eq!(
            store.verify("db.internal", 2222, None, &k2()),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            store.verify("10.0.0.9", 22, None, &k2()),
            HostKeyVerification::Changed { .. }
        ));
    }

    #[test]
    fn test_wildcards_and_negation() {
        let (_dir, store) = store_with(&format!(
            "*.prod.example.com,!bastion.prod.example.com {}\n",
            K1
        ));
        assert_eq!(
            store.verify("web1.prod.example.com", 22, None, &k1()),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            store.verify("bastion.prod.example.com", 22, None, &k1()),
            HostKeyVerification::Unknown { .. }
        ));

        let (_dir, store) = store_with(&format!("[*.internal]:2222 {}\n", K2));
        assert_eq!(
            store.verify("db.internal", 2222, None, &k2()),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_revoked_key_is_rejected() {
        let (_dir, store) = store_with(&format!(
            "@revoked * {}\nbuild.example.com {}\n",
            K1, K1
        ));
        assert!(matches!(
            store.verify("build.example.com", 22, None, &k1()),
            HostKeyVerification::Revoked { .. }
        ));
    }

    #[test]
    fn test_cert_authority_lines_are_not_host_keys() {
        let (_dir, store) = store_with(&format!("@cert-authority *.example.com {}\n", K1));
        assert!(store.keys_for_host("build.example.com", 22).is_empty());
    }

    #[test]
    fn test_add_host_is_idempotent() {
        let (dir, store) = store_with("");
        let addr: SocketAddr = "10.0.0.5:22".parse().unwrap();

        assert!(store.add_host("build.example.com", 22, Some(addr), &k1()).unwrap());
        assert!(!store.add_host("build.example.com", 22, Some(addr), &k1()).unwrap());

        let content = fs::read_to_string(dir.path().join("known_hosts")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.starts_with("build.example.com,10.0.0.5 ssh-ed25519 "));

        assert_eq!(
            store.verify("10.0.0.5", 22, None, &k1()),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_add_host_refuses_mismatch() {
        let (_dir, store) = store_with(&format!("10.0.0.5 {}\n", K1));
        let err = store.add_host("10.0.0.5", 22, None, &k2()).unwrap_err();
        assert!(matches!(err, SshError::HostKeyChanged { .. }));
    }

    #[test]
    fn test_append_after_missing_trailing_newline() {
        let (dir, store) = store_with(&format!("build.example.com {}", K1));
        assert!(store.add_host("10.0.0.5", 22, None, &k2()).unwrap());
        let content = fs::read_to_string(dir.path().join("known_hosts")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(store.keys_for_host("build.example.com", 22), vec![k1()]);
        assert_eq!(store.keys_for_host("10.0.0.5", 22), vec![k2()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_created_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");
        let _store = KnownHostsStore::open(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_shared_store_sees_external_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let first = KnownHostsStore::shared(&path).unwrap();
        assert!(first.keys_for_host("10.0.0.5", 22).is_empty());

        fs::write(&path, format!("10.0.0.5 {}\n", K1)).unwrap();
        let second = KnownHostsStore::shared(&path).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.keys_for_host("10.0.0.5", 22), vec![k1()]);
    }
}
