use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use headers::{Authorization, HeaderMapExt};
use http::Request;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs::CertificateResult;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid cluster url {0:?}, {1}")]
    ParseClusterUrl(String, #[source] http::uri::InvalidUri),

    #[error("failed to read file '{1:?}': {0}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    #[error("failed to decode base64 data: {0}")]
    DecodeBase64(#[source] base64::DecodeError),

    #[error("failed to parse PEM-encoded certificates: {0}")]
    ParseCertificates(#[source] pem::PemError),

    #[error("failed to add a root certificate: {0}")]
    AddRootCertificate(#[source] rustls::Error),

    #[error("failed to load native certificates: {0:?}")]
    LoadNativeCertificates(Vec<rustls_native_certs::Error>),

    #[error("token and token_file are mutually exclusive")]
    ConflictingToken,

    #[error("invalid bearer token")]
    InvalidToken,
}

/// How a cluster is reached. This is what the console keeps per cluster in
/// its own configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ClusterOptions {
    /// The address of the API server, e.g. `https://10.0.0.1:6443`
    pub server: String,

    /// Static bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Path to a bearer token which is re-read every minute, e.g. a
    /// projected service account token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,

    /// Path to a PEM bundle of CA certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<PathBuf>,

    /// Base64 encoded PEM bundle, takes precedence over `certificate_authority`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

struct Inner {
    token: String,
    expire_at: Instant,
}

#[derive(Clone)]
pub struct RefreshableToken {
    path: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

impl Debug for RefreshableToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshableToken")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RefreshableToken {
    pub(crate) fn new(path: PathBuf) -> std::io::Result<Self> {
        let token = std::fs::read_to_string(&path)?;

        Ok(RefreshableToken {
            path,
            inner: Arc::new(Mutex::new(Inner {
                token: token.trim().to_string(),
                expire_at: Instant::now() + Duration::from_secs(60),
            })),
        })
    }

    pub fn token(&self) -> std::io::Result<String> {
        let now = Instant::now();

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("token lock poisoned"))?;

        if now > inner.expire_at {
            let content = std::fs::read_to_string(&self.path)?;
            inner.token = content.trim().to_string();
            inner.expire_at = now + Duration::from_secs(60);
        }

        Ok(inner.token.clone())
    }
}

#[derive(Clone, Debug)]
pub enum Auth {
    None,
    Bearer { token: String },
    RefreshableToken(RefreshableToken),
}

impl Auth {
    pub fn apply<T>(&self, req: &mut Request<T>) -> std::io::Result<()> {
        let token = match self {
            Auth::None => return Ok(()),
            Auth::Bearer { token } => token.clone(),
            Auth::RefreshableToken(refreshable) => refreshable.token()?,
        };

        let header = Authorization::bearer(&token)
            .map_err(|_| std::io::Error::other(Error::InvalidToken))?;
        req.headers_mut().typed_insert(header);

        Ok(())
    }
}

/// Everything the [`Client`](crate::Client) needs to talk to one API server.
pub struct Config {
    /// The configured cluster url.
    pub cluster_url: http::Uri,

    /// Stores information to tell the cluster who you are.
    pub auth: Auth,

    pub tls: ClientConfig,
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("cluster_url", &self.cluster_url)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_options(options: &ClusterOptions) -> Result<Config, Error> {
        let cluster_url = options
            .server
            .parse::<http::Uri>()
            .map_err(|err| Error::ParseClusterUrl(options.server.clone(), err))?;

        let auth = match (&options.token, &options.token_file) {
            (Some(_), Some(_)) => return Err(Error::ConflictingToken),
            (Some(token), None) => Auth::Bearer {
                token: token.clone(),
            },
            (None, Some(path)) => {
                let token = RefreshableToken::new(path.clone())
                    .map_err(|err| Error::ReadFile(err, path.clone()))?;
                Auth::RefreshableToken(token)
            }
            (None, None) => Auth::None,
        };

        let ca = if let Some(data) = &options.certificate_authority_data {
            let data = base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(Error::DecodeBase64)?;
            Some(data)
        } else if let Some(path) = &options.certificate_authority {
            let data = std::fs::read(path).map_err(|err| Error::ReadFile(err, path.clone()))?;
            Some(data)
        } else {
            None
        };

        let root_store = match ca {
            Some(data) => root_store(&data)?,
            None => native_root_store()?,
        };

        let tls = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Config {
            cluster_url,
            auth,
            tls,
        })
    }
}

fn root_store(data: &[u8]) -> Result<RootCertStore, Error> {
    let certs = pem::parse_many(data)
        .map_err(Error::ParseCertificates)?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.into_contents()));

    let mut root_store = RootCertStore::empty();
    for cert in certs {
        root_store.add(cert).map_err(Error::AddRootCertificate)?;
    }

    Ok(root_store)
}

fn native_root_store() -> Result<RootCertStore, Error> {
    let CertificateResult { certs, errors, .. } = rustls_native_certs::load_native_certs();
    if certs.is_empty() && !errors.is_empty() {
        return Err(Error::LoadNativeCertificates(errors));
    }

    let mut root_store = RootCertStore::empty();
    for cert in certs {
        if let Err(err) = root_store.add(cert) {
            debug!(message = "certificate parse failed", %err);
        }
    }

    if root_store.is_empty() {
        debug!(message = "no valid native root CA certificates found");
    }

    Ok(root_store)
}
