// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type as aws_any_supported_type;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::fs;
use tracing::{debug, info};

use crate::config::TlsConfig;

const CA_COMMON_NAME: &str = "proxenet CA";
const CA_ORGANIZATION: &str = "proxenet";

/// Build a rustls `CertifiedKey` from a PEM chain and a PEM private key.
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>> {
    let chain: Vec<_> =
        rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        anyhow::bail!("no certificates parsed from PEM");
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
        .ok_or_else(|| anyhow::anyhow!("no private keys parsed from PEM"))?;
    let signer = aws_any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("failed to create key signer: {}", e))?;
    Ok(Arc::new(CertifiedKey::new(chain, signer)))
}

/// Signing CA that mints leaf certificates for intercepted hosts.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    /// Subject and signing key of the CA certificate as loaded.
    issuer: Issuer<'static, KeyPair>,
    /// Generated leaves keyed by host name.
    cache: Arc<RwLock<HashMap<String, Arc<CertifiedKey>>>>,
}

impl CertificateAuthority {
    pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .context("failed to read CA cert")?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .context("failed to read CA key")?;

        let key_pair =
            KeyPair::from_pem(&key_pem).context("failed to parse CA key pair from PEM")?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .context("failed to parse CA certificate")?;

        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem,
            issuer,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }))
    }

    /// Create a fresh CA and write it to disk.
    pub async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let params = Self::ca_params()?;
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key_pair)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        for p in [cert_path, key_path] {
            if let Some(parent) = p.parent() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(cert_path, &cert_pem).await?;
        fs::write(key_path, &key_pem).await?;
        info!(cert = %cert_path.display(), "generated CA");

        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem,
            issuer: Issuer::new(params, key_pair),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }))
    }

    /// Leaf certificate for `host`, signed by this CA.
    pub fn cert_for_host(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        {
            let cache = self
                .cache
                .read()
                .map_err(|e| anyhow::anyhow!("CA cache RwLock poisoned: {}", e))?;
            if let Some(cert) = cache.get(host) {
                return Ok(cert.clone());
            }
        }

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params.use_authority_key_identifier_extension = false;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.signed_by(&key_pair, &self.issuer)?;
        let certified_key = certified_key_from_pem(&cert.pem(), &key_pair.serialize_pem())?;
        debug!(%host, "minted leaf certificate");

        {
            let mut cache = self
                .cache
                .write()
                .map_err(|e| anyhow::anyhow!("CA cache RwLock poisoned: {}", e))?;
            cache.insert(host.to_string(), certified_key.clone());
        }

        Ok(certified_key)
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn ca_params() -> Result<CertificateParams> {
        let mut params = CertificateParams::new(Vec::<String>::new())
            .context("failed to create CA params")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_ORGANIZATION);
        Ok(params)
    }
}

/// Certificate material the proxy presents to browsers.
pub enum ServerIdentity {
    /// Per-host leaves minted from a CA.
    Minted(Arc<CertificateAuthority>),
    /// The configured pair, presented for every host.
    Fixed(Arc<CertifiedKey>),
}

impl ServerIdentity {
    pub async fn from_config(tls: &TlsConfig) -> Result<Self> {
        let cert_path = Path::new(&tls.cert_path);
        let key_path = Path::new(&tls.key_path);
        if tls.mint_leaf_certs {
            let ca = CertificateAuthority::load(cert_path, key_path).await?;
            Ok(ServerIdentity::Minted(ca))
        } else {
            let cert_pem = fs::read_to_string(cert_path)
                .await
                .with_context(|| format!("failed to read certificate {}", cert_path.display()))?;
            let key_pem = fs::read_to_string(key_path)
                .await
                .with_context(|| format!("failed to read private key {}", key_path.display()))?;
            Ok(ServerIdentity::Fixed(certified_key_from_pem(
                &cert_pem, &key_pem,
            )?))
        }
    }

    pub fn cert_for_host(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        match self {
            ServerIdentity::Minted(ca) => ca.cert_for_host(host),
            ServerIdentity::Fixed(key) => Ok(key.clone()),
        }
    }
}
