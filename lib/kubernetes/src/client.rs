use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::trace;

use super::config::{Auth, Config};
use super::resource::{ApiResource, ObjectList};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("build http request failed, {0}")]
    BuildRequest(http::Error),
    #[error("read http response failed, {0}")]
    ReadResponse(hyper::Error),
    #[error(transparent)]
    Http(hyper_util::client::legacy::Error),
    #[error("invalid params, {0}")]
    Validation(String),
    #[error("api server error, code: {}, reason: {}, message: {}", .0.code, .0.reason, .0.message)]
    Api(ErrorResponse),
    #[error("deserialize response failed, {0}")]
    Deserialize(serde_json::Error),
    #[error("read watch event failed, {0}")]
    ReadEvents(std::io::Error),
    #[error("chunk line is too large")]
    LinesCodecMaxLineLengthExceeded,
    #[error("load token failed, {0}")]
    Token(std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialize(err)
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::ReadResponse(err)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::BuildRequest(err)
    }
}

/// An error response from the API.
#[derive(Clone, Debug, Deserialize)]
pub struct ErrorResponse {
    /// The status
    #[serde(default)]
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

/// Common query parameters used in list calls on collections
#[derive(Debug, Default)]
pub struct ListParams {
    /// A selector to restrict the list of returned objects by their labels.
    pub label_selector: Option<String>,

    /// Limit the number of results
    ///
    /// If there are more results, the server will respond with a continue token
    /// which can be used to fetch another page of results.
    pub limit: Option<u32>,

    /// Fetch a second page of results.
    pub continue_token: Option<String>,
}

/// Common query parameters used in watch calls on collections
#[derive(Clone, Debug, Default)]
pub struct WatchParams {
    /// A selector to restrict returned objects by their labels.
    pub label_selector: Option<String>,

    /// A selector to restrict returned objects by their fields. Single object
    /// watches use `metadata.name=<name>`.
    pub field_selector: Option<String>,

    /// Timeout for the watch call.
    ///
    /// If unset for a watch call, we will use 290s. We limit this to 295s due to
    /// [inherent watch limitations](https://github.com/kubernetes/kubernetes/issues/6513).
    pub timeout: Option<u32>,

    /// Enables watch events with type "BOOKMARK"
    ///
    /// Servers that do not implement bookmarks ignore this flag and bookmarks are sent
    /// at the server's discretion.
    pub bookmarks: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BookmarkMeta {
    /// The only field we need from a Bookmark event.
    #[serde(rename = "resourceVersion")]
    pub resource_version: String,

    #[serde(default)]
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// Can only be relied upon to have metadata with resource version.
/// Bookmarks contain apiVersion + kind + basically empty metadata
///
/// See https://kubernetes.io/docs/reference/using-api/api-concepts/#watch-bookmarks
#[derive(Clone, Debug, Deserialize)]
pub struct Bookmark {
    /// Basically empty metadata
    pub metadata: BookmarkMeta,
}

/// A raw event returned from a watch query
///
/// Note that a watch query returns many of these as newline separated JSON
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    Deleted(K),
    /// Resource bookmark. `Bookmark` is a slimmed down `K`
    Bookmark(Bookmark),
    /// There was some kind of error
    Error(ErrorResponse),
}

#[derive(Clone)]
pub struct Client {
    http_client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    auth: Auth,
    endpoint: String,
}

impl Client {
    pub fn new(config: Config) -> Client {
        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(config.tls)
            .https_or_http();
        let mut inner = HttpConnector::new();
        inner.enforce_http(false);
        let connector = builder.enable_http1().wrap_connector(inner);

        let http_client =
            hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector);

        let endpoint = config
            .cluster_url
            .to_string()
            .trim_end_matches('/')
            .to_string();

        Client {
            http_client,
            endpoint,
            auth: config.auth,
        }
    }

    /// List a collection of a resource, the returned list metadata carries the
    /// resource version a subsequent watch should resume from.
    pub async fn list<K: DeserializeOwned>(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ObjectList<K>, Error> {
        let mut req = Request::builder()
            .method(Method::GET)
            .uri(format!(
                "{}{}?{}",
                self.endpoint,
                resource.url_path(namespace),
                list_query(params)
            ))
            .body(Full::<Bytes>::default())?;

        self.auth.apply(&mut req).map_err(Error::Token)?;

        let resp = self.http_client.request(req).await.map_err(Error::Http)?;
        let (parts, incoming) = resp.into_parts();
        let body = incoming.collect().await?.to_bytes();
        if !parts.status.is_success() {
            return Err(Error::Api(error_response(parts.status, &body)));
        }

        serde_json::from_slice::<ObjectList<K>>(&body).map_err(Error::Deserialize)
    }

    /// watch returns a stream the produce WatchEvent<K>, and it will stop if
    /// an error occurred or the connection timeout. So, user have to call this
    /// function again to get notified again.
    ///
    /// An empty `version` starts the watch from "now".
    pub async fn watch<K: DeserializeOwned + Send + 'static>(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &WatchParams,
        version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>, Error>>, Error> {
        let uri = format!(
            "{}{}?{}",
            self.endpoint,
            resource.url_path(namespace),
            watch_query(params, version)?
        );

        trace!(message = "doing http request", uri);

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::<Bytes>::default())?;

        self.auth.apply(&mut req).map_err(Error::Token)?;

        self.request_events(req).await
    }

    async fn request_events<K: DeserializeOwned + Send + 'static>(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>, Error>>, Error> {
        let resp = self.http_client.request(req).await.map_err(Error::Http)?;
        let (parts, incoming) = resp.into_parts();
        if !parts.status.is_success() {
            let body = incoming.collect().await?.to_bytes();
            return Err(Error::Api(error_response(parts.status, &body)));
        }

        let frames = FramedRead::new(
            StreamReader::new(incoming.into_data_stream().map_err(|err| {
                // Unexpected EOF from chunked decoder.
                // Tends to happen when watching for 300+s. This will be ignored
                if err.to_string().contains("unexpected EOF during check") {
                    return std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err);
                }

                std::io::Error::other(err)
            })),
            LinesCodec::new(),
        );

        Ok(Box::pin(frames.filter_map(|result| async {
            match result {
                Ok(line) => decode_line(&line),
                Err(LinesCodecError::Io(err)) => match err.kind() {
                    // Client timeout
                    std::io::ErrorKind::TimedOut => {
                        tracing::warn!("timeout in poll: {}", err);
                        None
                    }
                    // Tends to happen after 300+s of watching.
                    std::io::ErrorKind::UnexpectedEof => {
                        tracing::warn!("eof in poll: {}", err);
                        None
                    }
                    _ => Some(Err(Error::ReadEvents(err))),
                },

                // This should never happen because we're using the default `usize::MAX`.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    Some(Err(Error::LinesCodecMaxLineLengthExceeded))
                }
            }
        })))
    }
}

/// API servers answer failed requests with a `Status` object, whatever sits
/// in between (proxies, load balancers) may answer with anything.
fn error_response(status: StatusCode, body: &[u8]) -> ErrorResponse {
    serde_json::from_slice::<ErrorResponse>(body).unwrap_or_else(|_| ErrorResponse {
        status: "Failure".to_string(),
        message: String::from_utf8_lossy(body).trim().to_string(),
        reason: status.canonical_reason().unwrap_or_default().to_string(),
        code: status.as_u16(),
    })
}

fn list_query(params: &ListParams) -> String {
    let mut builder = form_urlencoded::Serializer::new(String::new());

    if let Some(label_selector) = &params.label_selector {
        builder.append_pair("labelSelector", label_selector);
    }
    if let Some(limit) = &params.limit {
        builder.append_pair("limit", &limit.to_string());
    }
    if let Some(continue_token) = &params.continue_token {
        builder.append_pair("continue", continue_token);
    }

    builder.finish()
}

fn watch_query(params: &WatchParams, version: &str) -> Result<String, Error> {
    if let Some(timeout) = params.timeout {
        if timeout >= 295 {
            return Err(Error::Validation("invalid timeout limit".into()));
        }
    }

    let mut builder = form_urlencoded::Serializer::new(String::new());

    if !version.is_empty() {
        builder.append_pair("resourceVersion", version);
    }
    builder.append_pair("watch", "true");
    // https://github.com/kubernetes/kubernetes/issues/6513
    builder.append_pair(
        "timeoutSeconds",
        params.timeout.unwrap_or(290).to_string().as_str(),
    );

    if let Some(label_selector) = params.label_selector.as_ref() {
        builder.append_pair("labelSelector", label_selector);
    }
    if let Some(field_selector) = params.field_selector.as_ref() {
        builder.append_pair("fieldSelector", field_selector);
    }
    if params.bookmarks {
        builder.append_pair("allowWatchBookmarks", "true");
    }

    Ok(builder.finish())
}

fn decode_line<K: DeserializeOwned>(line: &str) -> Option<Result<WatchEvent<K>, Error>> {
    match serde_json::from_str::<WatchEvent<K>>(line) {
        Ok(event) => Some(Ok(event)),
        Err(err) => {
            // Ignore EOF error that can happen for incomplete line from `decode_eof`.
            if err.is_eof() {
                return None;
            }

            // Got general error response
            if let Ok(e_resp) = serde_json::from_str::<ErrorResponse>(line) {
                return Some(Err(Error::Api(e_resp)));
            }

            Some(Err(Error::Deserialize(err)))
        }
    }
}
