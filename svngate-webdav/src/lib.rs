//! svngate WebDAV/DeltaV protocol boundary
//!
//! Implements the WebDAV dialect spoken by SVN clients over HTTP, translating
//! each method into operations against the upstream changeset server.

pub mod handlers;
pub mod report;
pub mod xml;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, Request, Response};
use tokio::sync::RwLock;

use svngate_core::{
    CasePolicy, Credentials, GateError, LoaderLimits, MetaCache, Recursion, SourceRepository,
};

/// Gateway configuration for the protocol layer.
#[derive(Debug, Clone)]
pub struct Config {
    /// URL prefix the gateway is mounted under.
    pub url_prefix: String,
    /// Maximum request body size (bytes).
    pub max_body_size: usize,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url_prefix: "/svn".to_string(),
            max_body_size: 100 * 1024 * 1024,
            debug: false,
        }
    }
}

/// A pending activity created by MKACTIVITY.
#[derive(Debug, Clone)]
pub struct ActivityState {
    pub id: String,
    pub author: String,
    pub base_changeset: i64,
    pub created_at: i64,
}

/// Everything a request handler needs, constructed once in `main` and
/// threaded through explicitly.
pub struct GatewayState {
    pub config: Config,
    pub source: Arc<dyn SourceRepository>,
    pub cache: Arc<MetaCache>,
    pub creds: Credentials,
    pub policy: CasePolicy,
    pub loader_limits: LoaderLimits,
    pub activities: RwLock<HashMap<String, ActivityState>>,
    /// Repository uuid advertised to clients; stable for the process
    /// lifetime (the gateway persists nothing across restarts).
    pub instance_uuid: String,
}

impl GatewayState {
    pub fn new(
        config: Config,
        source: Arc<dyn SourceRepository>,
        creds: Credentials,
        policy: CasePolicy,
        loader_limits: LoaderLimits,
    ) -> Self {
        let cache = Arc::new(MetaCache::new(source.clone(), creds.clone(), policy));
        Self {
            config,
            source,
            cache,
            creds,
            policy,
            loader_limits,
            activities: RwLock::new(HashMap::new()),
            instance_uuid: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// The URL shapes the gateway recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPath {
    /// A plain versioned resource.
    Plain { server_path: String },
    /// `!svn/act/<id>`
    Activity { id: String },
    /// `!svn/wrk/<activity>/<path>` — a working resource inside an activity.
    Working { activity: String, server_path: String },
    /// `!svn/ver/<rev>/<path>` or `!svn/rvr/<rev>/<path>`
    Version { revision: i64, server_path: String },
    /// `!svn/bln/<rev>`
    Baseline { revision: i64 },
    /// `!svn/vcc/default`
    Vcc,
    /// `!svn/bc/<rev>/<path>`
    BaselineCollection { revision: i64, server_path: String },
}

impl RequestPath {
    /// Parse a request URL path below the configured prefix.
    pub fn parse(config: &Config, url_path: &str) -> Result<RequestPath, GateError> {
        let rest = url_path
            .strip_prefix(&config.url_prefix)
            .unwrap_or(url_path)
            .trim_start_matches('/');

        if let Some(special) = rest.strip_prefix("!svn/") {
            let mut parts = special.splitn(3, '/');
            let kind = parts.next().unwrap_or_default();
            return match kind {
                "act" => {
                    let id = parts.next().unwrap_or_default();
                    if id.is_empty() {
                        return Err(GateError::UnsupportedPath(url_path.to_string()));
                    }
                    Ok(RequestPath::Activity { id: id.to_string() })
                }
                "wrk" => {
                    let activity = parts
                        .next()
                        .filter(|a| !a.is_empty())
                        .ok_or_else(|| GateError::UnsupportedPath(url_path.to_string()))?;
                    Ok(RequestPath::Working {
                        activity: activity.to_string(),
                        server_path: decode_server_path(parts.next().unwrap_or_default())?,
                    })
                }
                "ver" | "rvr" => {
                    let revision = parse_revision(parts.next(), url_path)?;
                    Ok(RequestPath::Version {
                        revision,
                        server_path: decode_server_path(parts.next().unwrap_or_default())?,
                    })
                }
                "bln" => {
                    let revision = parse_revision(parts.next(), url_path)?;
                    Ok(RequestPath::Baseline { revision })
                }
                "vcc" => Ok(RequestPath::Vcc),
                "bc" => {
                    let revision = parse_revision(parts.next(), url_path)?;
                    Ok(RequestPath::BaselineCollection {
                        revision,
                        server_path: decode_server_path(parts.next().unwrap_or_default())?,
                    })
                }
                _ => Err(GateError::UnsupportedPath(url_path.to_string())),
            };
        }

        Ok(RequestPath::Plain {
            server_path: decode_server_path(rest)?,
        })
    }
}

fn parse_revision(part: Option<&str>, url_path: &str) -> Result<i64, GateError> {
    part.and_then(|p| p.parse::<i64>().ok())
        .ok_or_else(|| GateError::UnsupportedPath(url_path.to_string()))
}

/// URL path below the prefix to a `$`-rooted server path, percent-decoded.
pub fn decode_server_path(rest: &str) -> Result<String, GateError> {
    let trimmed = rest.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(svngate_core::pathing::SERVER_ROOT.to_string());
    }
    let decoded = svngate_core::pathing::decode_percent(trimmed)?;
    Ok(format!("$/{decoded}"))
}

/// Map a `Depth:` header to a recursion level.
pub fn parse_depth(value: Option<&str>) -> Result<Recursion, GateError> {
    match value.unwrap_or("0") {
        "0" => Ok(Recursion::None),
        "1" => Ok(Recursion::OneLevel),
        "infinity" => Ok(Recursion::Full),
        other => Err(GateError::UnsupportedDepth(other.to_string())),
    }
}

/// Protocol-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum WebDavError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("XML parsing error: {0}")]
    Xml(String),

    #[error("XML generation error: {0}")]
    XmlGen(#[from] crate::xml::XmlError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl WebDavError {
    /// HTTP status this error maps to.
    pub fn status(&self) -> u16 {
        match self {
            WebDavError::InvalidRequest(_) | WebDavError::Xml(_) | WebDavError::XmlGen(_) => 400,
            WebDavError::Gate(GateError::NotFound(_)) => 404,
            WebDavError::Gate(GateError::UnsupportedPath(_)) => 405,
            WebDavError::Gate(GateError::UnsupportedDepth(_)) => 400,
            WebDavError::Gate(GateError::ChecksumMismatch { .. }) => 409,
            WebDavError::Gate(_) | WebDavError::Internal(_) => 500,
        }
    }
}

/// Request handler: collects the body, routes on the method, and renders
/// errors as DAV error envelopes.
pub struct BridgeHandler {
    pub state: Arc<GatewayState>,
}

impl BridgeHandler {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, WebDavError> {
        let method = req.method().as_str().to_string();
        let url_path = req.uri().path().to_string();
        let headers = req.headers().clone();

        tracing::debug!(%method, %url_path, "gateway request");
        if self.state.config.debug {
            tracing::info!("request headers:");
            for (name, value) in headers.iter() {
                tracing::info!("  {}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
        }

        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| WebDavError::InvalidRequest(format!("failed to read body: {e}")))?
            .to_bytes();
        if body.len() > self.state.config.max_body_size {
            return Err(WebDavError::InvalidRequest("request body too large".into()));
        }

        let state = self.state.as_ref();
        let outcome = match method.as_str() {
            "OPTIONS" => handlers::options_handler(state, &body).await,
            "PROPFIND" => handlers::propfind_handler(state, &url_path, &headers, &body).await,
            "PROPPATCH" => handlers::proppatch_handler(state, &url_path, &body).await,
            "REPORT" => handlers::report_handler(state, &url_path, &body).await,
            "MKACTIVITY" => handlers::mkactivity_handler(state, &url_path, &headers).await,
            "MKCOL" => handlers::mkcol_handler(state, &url_path).await,
            "DELETE" => handlers::delete_handler(state, &url_path).await,
            "PUT" => handlers::put_handler(state, &url_path, &headers, body.clone()).await,
            "GET" => handlers::get_handler(state, &url_path).await,
            "HEAD" => handlers::head_handler(state, &url_path).await,
            "MERGE" => handlers::merge_handler(state, &body).await,
            _ => Ok(Response::builder()
                .status(405)
                .header("Allow", handlers::ALLOWED_METHODS)
                .body(Full::new(Bytes::from("Method Not Allowed")))
                .expect("static response")),
        };

        let response = match outcome {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(%method, %url_path, error = %err, "request failed");
                error_response(&err)
            }
        };
        if self.state.config.debug {
            tracing::info!("response headers ({}):", response.status());
            for (name, value) in response.headers().iter() {
                tracing::info!("  {}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
        }
        Ok(response)
    }
}

/// Render a non-fatal error as a DAV error envelope with the dialect's
/// numeric code.
pub fn error_response(err: &WebDavError) -> Response<Full<Bytes>> {
    let code = match err {
        WebDavError::Gate(gate) => gate.dialect_code(),
        _ => 175002,
    };
    let body = xml::error_envelope(code, &err.to_string());
    Response::builder()
        .status(err.status())
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn test_parse_plain_path() {
        let parsed = RequestPath::parse(&config(), "/svn/Proj/dir/file.c").unwrap();
        assert_eq!(
            parsed,
            RequestPath::Plain {
                server_path: "$/Proj/dir/file.c".into()
            }
        );
        assert_eq!(
            RequestPath::parse(&config(), "/svn/").unwrap(),
            RequestPath::Plain {
                server_path: "$/".into()
            }
        );
    }

    #[test]
    fn test_parse_percent_encoded_path() {
        let parsed = RequestPath::parse(&config(), "/svn/Proj/dir%20name/a%26b.c").unwrap();
        assert_eq!(
            parsed,
            RequestPath::Plain {
                server_path: "$/Proj/dir name/a&b.c".into()
            }
        );
    }

    #[test]
    fn test_parse_special_paths() {
        assert_eq!(
            RequestPath::parse(&config(), "/svn/!svn/act/abc-123").unwrap(),
            RequestPath::Activity { id: "abc-123".into() }
        );
        assert_eq!(
            RequestPath::parse(&config(), "/svn/!svn/wrk/abc/Proj/f.c").unwrap(),
            RequestPath::Working {
                activity: "abc".into(),
                server_path: "$/Proj/f.c".into()
            }
        );
        assert_eq!(
            RequestPath::parse(&config(), "/svn/!svn/ver/12/Proj").unwrap(),
            RequestPath::Version {
                revision: 12,
                server_path: "$/Proj".into()
            }
        );
        assert_eq!(
            RequestPath::parse(&config(), "/svn/!svn/vcc/default").unwrap(),
            RequestPath::Vcc
        );
        assert_eq!(
            RequestPath::parse(&config(), "/svn/!svn/bln/9").unwrap(),
            RequestPath::Baseline { revision: 9 }
        );
    }

    #[test]
    fn test_unknown_special_path_is_rejected() {
        let err = RequestPath::parse(&config(), "/svn/!svn/zzz/1").unwrap_err();
        assert!(matches!(err, GateError::UnsupportedPath(_)));
    }

    #[test]
    fn test_parse_depth_tokens() {
        assert_eq!(parse_depth(Some("0")).unwrap(), Recursion::None);
        assert_eq!(parse_depth(Some("1")).unwrap(), Recursion::OneLevel);
        assert_eq!(parse_depth(Some("infinity")).unwrap(), Recursion::Full);
        assert_eq!(parse_depth(None).unwrap(), Recursion::None);
        assert!(matches!(
            parse_depth(Some("2")),
            Err(GateError::UnsupportedDepth(_))
        ));
    }
}
