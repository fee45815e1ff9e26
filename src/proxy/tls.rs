//! Root certificate authority for HTTPS interception
//!
//! The CA is generated once per storage directory and reused verbatim on
//! every later start. Leaf issuance is not implemented; the material is
//! exposed for whatever terminates TLS.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

use crate::error::ProxyError;

/// RSA modulus size of the root key
pub const CA_KEY_BITS: usize = 2048;

/// Years the root certificate stays valid
pub const CA_VALIDITY_YEARS: i32 = 10;

const CA_COMMON_NAME: &str = "Waylay Proxy CA";
const CERT_FILE: &str = "ca.crt";
const KEY_FILE: &str = "ca.key";

/// Certificate Authority owned by the proxy
pub struct CertificateAuthority {
    /// CA key pair, ready for signing
    ca_key: KeyPair,

    /// CA certificate PEM, as stored on disk
    ca_cert_pem: String,

    /// CA private key PEM, as stored on disk
    ca_key_pem: String,

    /// CA certificate DER
    ca_cert_der: CertificateDer<'static>,

    /// Directory holding the pair
    storage_dir: PathBuf,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("storage_dir", &self.storage_dir)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the CA from `storage_dir`, generating and persisting it first if
    /// either file is missing.
    pub fn ensure(storage_dir: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        let cert_path = storage_dir.join(CERT_FILE);
        let key_path = storage_dir.join(KEY_FILE);

        fs::create_dir_all(&storage_dir)
            .map_err(|e| ProxyError::certificate(&storage_dir, format!("cannot create directory: {}", e)))?;

        if !cert_path.exists() || !key_path.exists() {
            tracing::info!("Generating new proxy CA in {}", storage_dir.display());
            let (cert_pem, key_pem) = generate_ca(&storage_dir)?;
            write_file(&cert_path, cert_pem.as_bytes(), false)?;
            write_file(&key_path, key_pem.as_bytes(), true)?;
        }

        Self::load(&storage_dir)
    }

    /// Load an existing pair without generating anything
    pub fn load(storage_dir: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        let cert_path = storage_dir.join(CERT_FILE);
        let key_path = storage_dir.join(KEY_FILE);

        let ca_cert_pem = fs::read_to_string(&cert_path)
            .map_err(|e| ProxyError::certificate(&cert_path, format!("cannot read certificate: {}", e)))?;
        let ca_key_pem = fs::read_to_string(&key_path)
            .map_err(|e| ProxyError::certificate(&key_path, format!("cannot read private key: {}", e)))?;

        let ca_cert_der = CertificateDer::from_pem_slice(ca_cert_pem.as_bytes())
            .map_err(|e| ProxyError::certificate(&cert_path, format!("invalid certificate PEM: {:?}", e)))?;
        let ca_key = KeyPair::from_pem(&ca_key_pem)
            .map_err(|e| ProxyError::certificate(&key_path, format!("invalid private key PEM: {}", e)))?;

        tracing::debug!("Loaded proxy CA from {}", storage_dir.display());

        Ok(Self {
            ca_key,
            ca_cert_pem,
            ca_key_pem,
            ca_cert_der,
            storage_dir,
        })
    }

    /// Get CA certificate PEM
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get CA private key PEM
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Get CA certificate DER
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Signing key
    pub fn key_pair(&self) -> &KeyPair {
        &self.ca_key
    }

    pub fn cert_path(&self) -> PathBuf {
        self.storage_dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.storage_dir.join(KEY_FILE)
    }
}

/// Generate a fresh root: RSA-2048, SHA-256, valid for ten years from now
fn generate_ca(storage_dir: &Path) -> Result<(String, String), ProxyError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, CA_KEY_BITS)
        .map_err(|e| ProxyError::certificate(storage_dir, format!("RSA key generation failed: {}", e)))?;
    let key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| ProxyError::certificate(storage_dir, format!("cannot encode private key: {}", e)))?;

    let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| ProxyError::certificate(storage_dir, format!("cannot load generated key: {}", e)))?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::ContentCommitment,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
    ];
    params.serial_number = Some(SerialNumber::from(vec![0x01]));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, "Waylay");
    dn.push(DnType::OrganizationalUnitName, "Interception Proxy");
    dn.push(DnType::CountryName, "US");
    params.distinguished_name = dn;

    let (not_before, not_after) = validity_window(OffsetDateTime::now_utc());
    params.not_before = not_before;
    params.not_after = not_after;

    let ca_cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::certificate(storage_dir, format!("self-signing failed: {}", e)))?;

    Ok((ca_cert.pem(), key_pem.as_str().to_owned()))
}

/// `now` truncated to whole seconds, and the same instant ten years on
fn validity_window(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let not_before = now.replace_nanosecond(0).unwrap_or(now);
    let target_year = not_before.year() + CA_VALIDITY_YEARS;
    // Feb 29 has no counterpart in most target years
    let not_after = not_before
        .replace_year(target_year)
        .unwrap_or_else(|_| not_before + Duration::days(365 * CA_VALIDITY_YEARS as i64 + 2));
    (not_before, not_after)
}

fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<(), ProxyError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options
        .open(path)
        .map_err(|e| ProxyError::certificate(path, format!("cannot write file: {}", e)))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| ProxyError::certificate(path, format!("cannot write file: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use x509_parser::extensions::ParsedExtension;
    use x509_parser::parse_x509_certificate;

    #[test]
    fn test_ca_generated_then_reused() {
        let dir = tempdir().unwrap();

        let first = CertificateAuthority::ensure(dir.path()).unwrap();
        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("ca.key").exists());
        assert!(first.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(first.ca_key_pem().contains("BEGIN PRIVATE KEY"));

        let cert_bytes = fs::read(first.cert_path()).unwrap();
        let key_bytes = fs::read(first.key_path()).unwrap();

        let second = CertificateAuthority::ensure(dir.path()).unwrap();
        assert_eq!(second.ca_cert_pem(), first.ca_cert_pem());
        assert_eq!(second.ca_key_pem(), first.ca_key_pem());
        assert_eq!(fs::read(second.cert_path()).unwrap(), cert_bytes);
        assert_eq!(fs::read(second.key_path()).unwrap(), key_bytes);
    }

    #[test]
    fn test_certificate_contents() {
        let dir = tempdir().unwrap();
        let before = OffsetDateTime::now_utc().unix_timestamp();
        let ca = CertificateAuthority::ensure(dir.path()).unwrap();
        let after = OffsetDateTime::now_utc().unix_timestamp();

        let (_, cert) = parse_x509_certificate(ca.ca_cert_der().as_ref()).unwrap();
        assert_eq!(cert.subject(), cert.issuer());
        assert!(cert.subject().to_string().contains(CA_COMMON_NAME));
        assert_eq!(cert.raw_serial(), &[0x01]);

        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        assert!(not_before >= before - 1 && not_before <= after);
        let ten_years = 10 * 365 * 24 * 3600;
        assert!(not_after - not_before >= ten_years);
        assert!(not_after - not_before <= ten_years + 3 * 24 * 3600);

        let mut is_ca = false;
        let mut can_sign_certs = false;
        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::BasicConstraints(bc) => is_ca = bc.ca,
                ParsedExtension::KeyUsage(ku) => {
                    can_sign_certs = ku.key_cert_sign() && ku.digital_signature()
                }
                _ => {}
            }
        }
        assert!(is_ca);
        assert!(can_sign_certs);

        // sha256WithRSAEncryption
        assert_eq!(
            cert.signature_algorithm.algorithm.to_id_string(),
            "1.2.840.113549.1.1.11"
        );
    }

    #[test]
    fn test_missing_half_regenerates_pair() {
        let dir = tempdir().unwrap();
        let first = CertificateAuthority::ensure(dir.path()).unwrap();
        fs::remove_file(first.key_path()).unwrap();

        let second = CertificateAuthority::ensure(dir.path()).unwrap();
        assert_ne!(second.ca_key_pem(), first.ca_key_pem());
    }

    #[test]
    fn test_unwritable_storage_fails() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        let result = CertificateAuthority::ensure(blocker.join("certs"));
        assert!(matches!(result, Err(ProxyError::CertificateInit { .. })));
    }

    #[test]
    fn test_corrupt_files_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("ca.crt"), b"garbage").unwrap();
        fs::write(dir.path().join("ca.key"), b"garbage").unwrap();

        assert!(matches!(
            CertificateAuthority::ensure(dir.path()),
            Err(ProxyError::CertificateInit { .. })
        ));
    }

    #[test]
    fn test_validity_window_leap_day() {
        let leap = time::macros::datetime!(2024-02-29 12:00:00.5 UTC);
        let (not_before, not_after) = validity_window(leap);
        assert_eq!(not_before.nanosecond(), 0);
        assert_eq!(not_after.year(), 2034);

        let plain = time::macros::datetime!(2026-10-19 08:30:00 UTC);
        let (_, not_after) = validity_window(plain);
        assert_eq!(not_after, time::macros::datetime!(2036-10-19 08:30:00 UTC));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::ensure(dir.path()).unwrap();
        let mode = fs::metadata(ca.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
