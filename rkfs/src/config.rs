use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use libvfs::CollisionPolicy;
use serde::Deserialize;

use crate::error::MasterError;

/// TLS 1.3 suites QUIC can run with.
pub const KNOWN_CIPHER_SUITES: &[&str] = &[
    "TLS13_AES_128_GCM_SHA256",
    "TLS13_AES_256_GCM_SHA384",
    "TLS13_CHACHA20_POLY1305_SHA256",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // ip:port the slaves connect to
    pub addr: String,
    #[serde(default = "default_vfs_root")]
    pub vfs_root: PathBuf,
    #[serde(default = "default_slaves_dir")]
    pub slaves_dir: PathBuf,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub remerge: RemergeConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// Refuse to start with a generated certificate.
    #[serde(default)]
    pub require_certificate: bool,
    /// DER encoded certificate.
    pub cert_path: Option<PathBuf>,
    /// DER encoded PKCS#8 private key.
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub cipher_suites: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialRemergeMode {
    /// Always ask for the full listing.
    #[default]
    Off,
    /// Only files changed since the slave last connected.
    Connect,
    /// Only files changed since the slave was last seen online.
    Disconnect,
    /// Full listing, but the slave is usable while it runs.
    Instant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemergeConfig {
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    #[serde(default)]
    pub checksums: bool,
    #[serde(default)]
    pub partial_mode: PartialRemergeMode,
    /// Queued listings above which the slave is asked to pause.
    #[serde(default = "default_pause_threshold")]
    pub pause_threshold: usize,
    /// Queued listings at or below which a paused slave resumes.
    #[serde(default = "default_resume_threshold")]
    pub resume_threshold: usize,
}

impl Default for RemergeConfig {
    fn default() -> Self {
        RemergeConfig {
            collision_policy: CollisionPolicy::default(),
            checksums: false,
            partial_mode: PartialRemergeMode::default(),
            pause_threshold: default_pause_threshold(),
            resume_threshold: default_resume_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    #[serde(default = "default_response_secs")]
    pub response_secs: u64,
    #[serde(default = "default_delete_secs")]
    pub delete_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            handshake_secs: default_handshake_secs(),
            response_secs: default_response_secs(),
            delete_secs: default_delete_secs(),
        }
    }
}

impl Timeouts {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn response(&self) -> Duration {
        Duration::from_secs(self.response_secs)
    }

    pub fn delete(&self) -> Duration {
        Duration::from_secs(self.delete_secs)
    }
}

fn default_vfs_root() -> PathBuf {
    PathBuf::from("userdata/vfs")
}

fn default_slaves_dir() -> PathBuf {
    PathBuf::from("userdata/slaves")
}

fn default_commit_interval_ms() -> u64 {
    10_000
}

fn default_pause_threshold() -> usize {
    250
}

fn default_resume_threshold() -> usize {
    50
}

fn default_handshake_secs() -> u64 {
    10
}

fn default_response_secs() -> u64 {
    60
}

fn default_delete_secs() -> u64 {
    300
}

impl TlsConfig {
    /// Rejects settings the slave listener cannot honour.
    pub fn validate(&self) -> std::result::Result<(), MasterError> {
        match (&self.cert_path, &self.key_path) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(MasterError::FatalConfiguration(
                    "cert_path and key_path must be set together".to_string(),
                ));
            }
            (None, None) if self.require_certificate => {
                return Err(MasterError::FatalConfiguration(
                    "secure slave connections require a certificate but none is configured"
                        .to_string(),
                ));
            }
            _ => {}
        }
        for suite in &self.cipher_suites {
            if !KNOWN_CIPHER_SUITES.contains(&suite.as_str()) {
                return Err(MasterError::FatalConfiguration(format!(
                    "unsupported cipher suite {suite}"
                )));
            }
        }
        if !self.protocols.is_empty() && !self.protocols.iter().any(|p| p == "TLSv1.3") {
            return Err(MasterError::FatalConfiguration(format!(
                "slave connections need TLSv1.3, configured protocols are {:?}",
                self.protocols
            )));
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> std::result::Result<(), MasterError> {
        self.tls.validate()?;
        if self.remerge.resume_threshold > self.remerge.pause_threshold {
            return Err(MasterError::FatalConfiguration(format!(
                "remerge resume threshold {} is above the pause threshold {}",
                self.remerge.resume_threshold, self.remerge.pause_threshold
            )));
        }
        Ok(())
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
