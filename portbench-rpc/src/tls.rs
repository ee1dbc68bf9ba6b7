use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{desc} missing: {path}")]
    MissingFile { desc: &'static str, path: PathBuf },

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("could not bootstrap TLS material: `openssl` exited with {0}")]
    OpensslFailed(std::process::ExitStatus),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// The TLS material directory shared by servers and clients:
/// `cert.pem`/`key.pem` identify this endpoint, `ca_file.pem` lists the
/// certificates the peer may present.
#[derive(Debug, Clone)]
pub struct SslInfo {
    pub dir: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
}

impl SslInfo {
    pub fn in_dir(dir: &Path) -> Self {
        SslInfo {
            dir: dir.to_owned(),
            cert_file: dir.join("cert.pem"),
            key_file: dir.join("key.pem"),
            ca_file: dir.join("ca_file.pem"),
        }
    }

    pub fn check_files(&self) -> Result<(), TlsError> {
        for (path, desc) in [
            (&self.cert_file, "SSL certificate file"),
            (&self.key_file, "SSL key file"),
            (&self.ca_file, "SSL CA file"),
        ] {
            if !path.is_file() {
                return Err(TlsError::MissingFile {
                    desc,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Returns the TLS material in `dir`, creating a self-signed certificate on
/// first launch. The freshly created certificate doubles as the CA file, so
/// a new server trusts exactly itself until more clients are authorized.
pub fn ensure_ssl_dir(dir: &Path) -> Result<SslInfo, TlsError> {
    let info = SslInfo::in_dir(dir);
    if !dir.is_dir() {
        std::fs::create_dir_all(dir)?;
        log::info!("creating self-signed SSL certificate for remote connections");
        let status = Command::new("openssl")
            .arg("req")
            .arg("-new")
            .arg("-x509")
            .arg("-days")
            .arg("3650")
            .arg("-nodes")
            .arg("-subj")
            .arg("/CN=portbench measurement server")
            .arg("-out")
            .arg(&info.cert_file)
            .arg("-keyout")
            .arg(&info.key_file)
            .status()?;
        if !status.success() {
            return Err(TlsError::OpensslFailed(status));
        }
        std::fs::copy(&info.cert_file, &info.ca_file)?;
        log::info!(
            "done creating certificate; consider adding authorized clients to {}",
            info.ca_file.display()
        );
    }
    info.check_files()?;
    Ok(info)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    Ok(certs?)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_owned()))
}

/// Server-side config: presents `cert.pem` and requires clients to present
/// a certificate listed in `ca_file.pem`.
pub fn server_config(info: &SslInfo) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs(&info.cert_file)?;
    let key = load_key(&info.key_file)?;
    let mut roots = RootCertStore::empty();
    for ca in load_certs(&info.ca_file)? {
        roots.add(ca)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Client-side config: presents `cert.pem` for client authentication and
/// accepts exactly the server certificates pinned in `ca_file.pem`. The
/// certificates are self-signed, so hostname-based webpki validation does
/// not apply; trust is by certificate identity.
pub fn client_config(info: &SslInfo) -> Result<Arc<ClientConfig>, TlsError> {
    let certs = load_certs(&info.cert_file)?;
    let key = load_key(&info.key_file)?;
    let pinned = load_certs(&info.ca_file)?;
    let verifier = Arc::new(PinnedServerVerifier::new(pinned));
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Accepts a server certificate iff its DER bytes match one of the pinned
/// certificates. Signatures are still verified with the default provider's
/// algorithms.
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned: Vec<CertificateDer<'static>>,
    supported: WebPkiSupportedAlgorithms,
}

impl PinnedServerVerifier {
    fn new(pinned: Vec<CertificateDer<'static>>) -> Self {
        PinnedServerVerifier {
            pinned,
            supported: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self
            .pinned
            .iter()
            .any(|c| c.as_ref() == end_entity.as_ref())
        {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_info_paths() {
        let info = SslInfo::in_dir(Path::new("/tmp/portbench_ssl"));
        assert_eq!(info.cert_file, Path::new("/tmp/portbench_ssl/cert.pem"));
        assert_eq!(info.key_file, Path::new("/tmp/portbench_ssl/key.pem"));
        assert_eq!(info.ca_file, Path::new("/tmp/portbench_ssl/ca_file.pem"));
    }

    #[test]
    fn missing_files_are_reported_with_their_role() {
        let info = SslInfo::in_dir(Path::new("/nonexistent-portbench-ssl"));
        let err = info.check_files().unwrap_err();
        assert!(matches!(
            err,
            TlsError::MissingFile {
                desc: "SSL certificate file",
                ..
            }
        ));
    }
}
