//! Workload API client for SPIRE
//!
//! Fetches X.509 SVIDs and trust bundles from the local SPIRE agent over its Unix domain
//! socket. Only the first message of each server stream is read; the managed client drives
//! refreshes on its own schedule.

use crate::error::{Error, Result};
use crate::source::CredentialSource;
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::X509Svid;
use crate::trust_bundle::TrustBundle;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Default SPIRE agent socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/spire-agent/public/api.sock";

/// Environment variable naming the Workload API socket
pub const SOCKET_ENV: &str = "SPIFFE_ENDPOINT_SOCKET";

const SECURITY_HEADER: &str = "workload.spiffe.io";
const FETCH_X509_SVID: &str = "/SpiffeWorkloadAPI/FetchX509SVID";
const FETCH_X509_BUNDLES: &str = "/SpiffeWorkloadAPI/FetchX509Bundles";

/// Workload API messages, matching `workload.proto`
pub mod proto {
    use std::collections::HashMap;
    use std::fmt;

    /// Request for X.509 SVIDs
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct X509SvidRequest {}

    /// Response carrying the workload's X.509 SVIDs
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct X509SvidResponse {
        /// SVIDs the workload is entitled to
        #[prost(message, repeated, tag = "1")]
        pub svids: Vec<X509SvidEntry>,
        /// Revocation lists (DER)
        #[prost(bytes = "vec", repeated, tag = "2")]
        pub crl: Vec<Vec<u8>>,
        /// Bundles of federated trust domains, keyed by trust domain ID
        #[prost(map = "string, bytes", tag = "3")]
        pub federated_bundles: HashMap<String, Vec<u8>>,
    }

    /// A single X.509 SVID
    #[derive(Clone, PartialEq, prost::Message)]
    #[prost(skip_debug)]
    pub struct X509SvidEntry {
        /// SPIFFE ID of the SVID
        #[prost(string, tag = "1")]
        pub spiffe_id: String,
        /// Certificate chain, concatenated DER, leaf first
        #[prost(bytes = "vec", tag = "2")]
        pub x509_svid: Vec<u8>,
        /// PKCS#8 private key (DER)
        #[prost(bytes = "vec", tag = "3")]
        pub x509_svid_key: Vec<u8>,
        /// Bundle of the SVID's trust domain, concatenated DER
        #[prost(bytes = "vec", tag = "4")]
        pub bundle: Vec<u8>,
        /// Operator-assigned hint to tell SVIDs apart
        #[prost(string, tag = "5")]
        pub hint: String,
    }

    impl fmt::Debug for X509SvidEntry {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("X509SvidEntry")
                .field("spiffe_id", &self.spiffe_id)
                .field("x509_svid_len", &self.x509_svid.len())
                .field("x509_svid_key", &"<redacted>")
                .field("hint", &self.hint)
                .finish()
        }
    }

    /// Request for X.509 bundles
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct X509BundlesRequest {}

    /// Response carrying every X.509 bundle the workload trusts
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct X509BundlesResponse {
        /// Revocation lists (DER)
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub crl: Vec<Vec<u8>>,
        /// Bundles keyed by trust domain ID, concatenated DER
        #[prost(map = "string, bytes", tag = "2")]
        pub bundles: HashMap<String, Vec<u8>>,
    }
}

/// Configuration for Workload API client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadApiConfig {
    /// Socket path for SPIRE agent
    pub socket_path: PathBuf,
    /// Bound on connecting and on each call
    pub timeout: Duration,
}

impl Default for WorkloadApiConfig {
    fn default() -> Self {
        WorkloadApiConfig {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            timeout: Duration::from_secs(10),
        }
    }
}

impl WorkloadApiConfig {
    /// Configuration taking the socket from `SPIFFE_ENDPOINT_SOCKET` when set
    pub fn from_env() -> Self {
        WorkloadApiConfig {
            socket_path: socket_path_from(std::env::var(SOCKET_ENV).ok()),
            ..Self::default()
        }
    }

    /// Set the socket path
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn socket_path_from(value: Option<String>) -> PathBuf {
    match value {
        Some(value) if !value.trim().is_empty() => {
            let value = value.trim();
            PathBuf::from(value.strip_prefix("unix://").unwrap_or(value))
        }
        _ => PathBuf::from(DEFAULT_SOCKET_PATH),
    }
}

/// Workload API client for fetching SVIDs and bundles
#[derive(Clone)]
pub struct WorkloadApiClient {
    /// gRPC channel to SPIRE agent
    channel: Channel,
    socket_path: PathBuf,
    timeout: Duration,
}

impl fmt::Debug for WorkloadApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadApiClient")
            .field("socket_path", &self.socket_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WorkloadApiClient {
    /// Connect to the SPIRE agent via Unix socket
    pub async fn connect(config: WorkloadApiConfig) -> Result<Self> {
        if !config.socket_path.exists() {
            warn!(socket_path = %config.socket_path.display(), "SPIRE agent socket does not exist");
            return Err(Error::collaborator_unavailable(format!(
                "socket path does not exist: {}",
                config.socket_path.display()
            )));
        }

        info!(socket_path = %config.socket_path.display(), "Connecting to SPIRE agent");

        let socket_path = config.socket_path.clone();
        // tonic needs a URI; the connector ignores it
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| Error::collaborator_unavailable(e.to_string()))?
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = socket_path.clone();
                async move {
                    UnixStream::connect(path)
                        .await
                        .map(hyper_util::rt::TokioIo::new)
                }
            }))
            .await
            .map_err(|e| {
                Error::collaborator_unavailable(format!("failed to connect to SPIRE agent: {}", e))
            })?;

        Ok(WorkloadApiClient {
            channel,
            socket_path: config.socket_path,
            timeout: config.timeout,
        })
    }

    /// Socket this client talks to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Fetch the X.509 SVID matching `hint`, or the first one offered
    pub async fn fetch_x509_svid(&self, hint: Option<&SpiffeId>) -> Result<X509Svid> {
        debug!(hint = ?hint.map(|h| h.to_string()), "Fetching X.509 SVID from SPIRE agent");

        let response: proto::X509SvidResponse = self
            .first_message(FETCH_X509_SVID, proto::X509SvidRequest {})
            .await?;

        let mut svids = response.svids;
        let svid = take_svid(&mut svids, hint)?;

        info!(
            spiffe_id = %svid.spiffe_id(),
            serial = %svid.serial_number(),
            expiry = %svid.expiry(),
            "Fetched X.509 SVID"
        );
        Ok(svid)
    }

    /// Fetch every X.509 bundle the agent offers, keyed by trust domain
    pub async fn fetch_bundles(&self) -> Result<HashMap<TrustDomain, TrustBundle>> {
        let response: proto::X509BundlesResponse = self
            .first_message(FETCH_X509_BUNDLES, proto::X509BundlesRequest {})
            .await?;

        let mut bundles = HashMap::with_capacity(response.bundles.len());
        for (key, der) in response.bundles {
            let trust_domain = trust_domain_from_key(&key)?;
            let bundle = TrustBundle::from_der_concatenated(trust_domain.clone(), &der)?;
            bundles.insert(trust_domain, bundle);
        }

        debug!(bundle_count = bundles.len(), "Fetched X.509 bundles");
        Ok(bundles)
    }

    /// Check the agent answers with at least one SVID
    pub async fn health_check(&self) -> Result<()> {
        self.fetch_x509_svid(None).await?;
        debug!("Health check passed");
        Ok(())
    }

    async fn first_message<Req, Resp>(&self, path: &'static str, message: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let call = async {
            let mut grpc = tonic::client::Grpc::new(self.channel.clone());
            grpc.ready().await.map_err(|e| {
                Error::collaborator_unavailable(format!("SPIRE agent not ready: {}", e))
            })?;

            let mut request = tonic::Request::new(message);
            request
                .metadata_mut()
                .insert(SECURITY_HEADER, MetadataValue::from_static("true"));

            let codec: ProstCodec<Req, Resp> = ProstCodec::default();
            let mut stream = grpc
                .server_streaming(request, PathAndQuery::from_static(path), codec)
                .await
                .map_err(|status| rpc_error(path, status))?
                .into_inner();

            let first = stream
                .message()
                .await
                .map_err(|status| rpc_error(path, status))?
                .ok_or_else(|| {
                    Error::collaborator_unavailable(format!(
                        "{} stream closed without a message",
                        path
                    ))
                })?;
            Ok::<Resp, Error>(first)
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::collaborator_unavailable(format!("{} timed out", path)))?
    }
}

#[async_trait]
impl CredentialSource for WorkloadApiClient {
    async fn fetch_credential(&self, hint: Option<&SpiffeId>) -> Result<X509Svid> {
        self.fetch_x509_svid(hint).await
    }

    async fn fetch_trust_bundle(&self, trust_domain: &TrustDomain) -> Result<TrustBundle> {
        let mut bundles = self.fetch_bundles().await?;
        bundles.remove(trust_domain).ok_or_else(|| {
            Error::collaborator_unavailable(format!(
                "SPIRE agent has no bundle for trust domain {}",
                trust_domain
            ))
        })
    }
}

fn rpc_error(path: &str, status: tonic::Status) -> Error {
    Error::collaborator_unavailable(format!(
        "{} failed: {} ({:?})",
        path,
        status.message(),
        status.code()
    ))
}

/// Parse the selected SVID; every offered key is zeroed whatever the outcome
fn take_svid(svids: &mut [proto::X509SvidEntry], hint: Option<&SpiffeId>) -> Result<X509Svid> {
    let svid = select_svid(svids, hint)
        .and_then(|entry| X509Svid::from_der(&entry.x509_svid, &entry.x509_svid_key));
    for entry in svids.iter_mut() {
        entry.x509_svid_key.zeroize();
    }
    svid
}

/// Pick the SVID named by `hint`, or the first one when there is no hint
fn select_svid<'a>(
    svids: &'a [proto::X509SvidEntry],
    hint: Option<&SpiffeId>,
) -> Result<&'a proto::X509SvidEntry> {
    let offered = svids.len();
    let mut svids = svids.iter();
    let selected = match hint {
        Some(hint) => {
            let wanted = hint.to_string();
            svids.find(|entry| entry.spiffe_id == wanted)
        }
        None => svids.next(),
    };

    selected.ok_or_else(|| match hint {
        Some(hint) => Error::collaborator_unavailable(format!(
            "none of the {} SVIDs offered is {}",
            offered, hint
        )),
        None => Error::collaborator_unavailable("SPIRE agent returned no SVIDs"),
    })
}

/// Bundle map keys are trust domain IDs (`spiffe://example.org`); bare names are accepted too
fn trust_domain_from_key(key: &str) -> Result<TrustDomain> {
    TrustDomain::new(key.strip_prefix("spiffe://").unwrap_or(key))
}
