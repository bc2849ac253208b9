//! Collaborator hooks consumed by the server, not produced by it.
//!
//! Certificate acquisition and tunnel management live outside the core;
//! the gateway only asks two questions at startup: "do I have certificate
//! material?" (drives the HTTPS listener) and "what is my external URL?"
//! (banner only). The shipped implementations read file paths and values
//! from the settings store.

use std::sync::Arc;

use anyhow::Context;

use crate::registry::Registry;

/// Key, certificate, and optional chain, all PEM-encoded.
pub struct CertMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub chain_pem: Option<Vec<u8>>,
}

pub trait CertificateSource: Send + Sync {
    /// Return certificate material, or `None` when HTTPS should stay off.
    fn certificate(&self) -> anyhow::Result<Option<CertMaterial>>;
}

pub trait ExternalUrlSource: Send + Sync {
    /// Publicly reachable URL, if a tunnel/port-mapping collaborator
    /// provided one. Used only for logging.
    fn external_url(&self) -> Option<String>;
}

/// Reads `cert_path` / `key_path` (and optional `chain_path`) settings and
/// loads the files they point to.
pub struct SettingsCertSource {
    registry: Arc<Registry>,
}

impl SettingsCertSource {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl CertificateSource for SettingsCertSource {
    fn certificate(&self) -> anyhow::Result<Option<CertMaterial>> {
        let cert_path = self.registry.get_setting("cert_path").unwrap_or(None);
        let key_path = self.registry.get_setting("key_path").unwrap_or(None);
        let (cert_path, key_path) = match (cert_path, key_path) {
            (Some(c), Some(k)) => (c, k),
            _ => return Ok(None),
        };

        let cert_pem = std::fs::read(&cert_path)
            .with_context(|| format!("reading certificate {cert_path}"))?;
        let key_pem =
            std::fs::read(&key_path).with_context(|| format!("reading key {key_path}"))?;
        let chain_pem = match self.registry.get_setting("chain_path").unwrap_or(None) {
            Some(path) => {
                Some(std::fs::read(&path).with_context(|| format!("reading chain {path}"))?)
            }
            None => None,
        };

        Ok(Some(CertMaterial {
            cert_pem,
            key_pem,
            chain_pem,
        }))
    }
}

/// Reads the `external_url` setting.
pub struct SettingsExternalUrl {
    registry: Arc<Registry>,
}

impl SettingsExternalUrl {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl ExternalUrlSource for SettingsExternalUrl {
    fn external_url(&self) -> Option<String> {
        self.registry.get_setting("external_url").unwrap_or(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_settings_mean_no_https() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let source = SettingsCertSource::new(registry);
        assert!(source.certificate().unwrap().is_none());
    }

    #[test]
    fn material_loaded_from_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, b"CERT").unwrap();
        std::fs::write(&key, b"KEY").unwrap();

        let registry = Arc::new(Registry::open_in_memory().unwrap());
        registry
            .set_setting("cert_path", cert.to_str().unwrap(), "tls")
            .unwrap();
        registry
            .set_setting("key_path", key.to_str().unwrap(), "tls")
            .unwrap();

        let material = SettingsCertSource::new(Arc::clone(&registry))
            .certificate()
            .unwrap()
            .unwrap();
        assert_eq!(material.cert_pem, b"CERT");
        assert_eq!(material.key_pem, b"KEY");
        assert!(material.chain_pem.is_none());
    }

    #[test]
    fn missing_file_is_an_error_not_silence() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        registry.set_setting("cert_path", "/nope.pem", "tls").unwrap();
        registry.set_setting("key_path", "/nope.key", "tls").unwrap();
        assert!(SettingsCertSource::new(registry).certificate().is_err());
    }

    #[test]
    fn external_url_comes_from_settings() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let source = SettingsExternalUrl::new(Arc::clone(&registry));
        assert!(source.external_url().is_none());
        registry
            .set_setting("external_url", "https://gw.example.com", "network")
            .unwrap();
        assert_eq!(
            source.external_url().as_deref(),
            Some("https://gw.example.com")
        );
    }
}
