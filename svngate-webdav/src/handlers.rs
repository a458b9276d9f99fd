//! HTTP method handlers.
//!
//! Each handler receives the shared [`GatewayState`] plus the parts of the
//! request it consumes, and produces a complete response. Fallible paths
//! return [`WebDavError`]; the dispatcher renders those as DAV error
//! envelopes.

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::Response;
use md5::{Digest, Md5};
use quick_xml::events::Event;
use tracing::{debug, info};
use uuid::Uuid;

use svngate_core::pathing::escape_xml;
use svngate_core::{GateError, Recursion, SourceItemKind};

use crate::{
    parse_depth, report, xml, ActivityState, GatewayState, RequestPath, WebDavError,
};

pub const ALLOWED_METHODS: &str =
    "OPTIONS,GET,HEAD,DELETE,PROPFIND,PROPPATCH,PUT,MKCOL,MKACTIVITY,MERGE,REPORT";

type HandlerResult = Result<Response<Full<Bytes>>, WebDavError>;

fn xml_response(status: u16, body: String) -> HandlerResult {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .body(Full::new(Bytes::from(body)))
        .expect("static response"))
}

fn empty_response(status: u16) -> HandlerResult {
    Ok(Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response"))
}

fn extract_text_between<'a>(s: &'a str, start_tag: &str, end_tag: &str) -> Option<&'a str> {
    let start = s.find(start_tag)? + start_tag.len();
    let end = s[start..].find(end_tag)? + start;
    Some(&s[start..end])
}

// ==================== OPTIONS ====================

pub async fn options_handler(state: &GatewayState, body: &[u8]) -> HandlerResult {
    let body_str = String::from_utf8_lossy(body);
    let wants_activity_set = body_str.contains("activity-collection-set");
    let prefix = &state.config.url_prefix;

    let response_body = if wants_activity_set {
        format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:options-response xmlns:D=\"DAV:\">\n<D:activity-collection-set><D:href>{prefix}/!svn/act/</D:href></D:activity-collection-set></D:options-response>"
        )
    } else {
        String::new()
    };

    let mut builder = Response::builder()
        .status(200)
        .header("Allow", ALLOWED_METHODS)
        .header("DAV", "1,2")
        .header("DAV", "version-control,checkout,working-resource")
        .header("DAV", "merge,baseline,activity,version-controlled-collection")
        .header("DAV", "http://subversion.tigris.org/xmlns/dav/svn/depth")
        .header("MS-Author-Via", "DAV");

    if wants_activity_set {
        let youngest = state
            .source
            .get_latest_changeset(&state.creds)
            .await
            .map_err(GateError::Upstream)?;
        builder = builder
            .header("SVN-Youngest-Rev", youngest.to_string())
            .header("SVN-Repository-UUID", &state.instance_uuid)
            .header("SVN-Repository-Root", prefix.as_str())
            .header("SVN-Rev-Root-Stub", format!("{prefix}/!svn/rvr"))
            .header("SVN-Rev-Stub", format!("{prefix}/!svn/rev"))
            .header("Content-Type", "text/xml; charset=\"utf-8\"");
    }

    Ok(builder
        .body(Full::new(Bytes::from(response_body)))
        .expect("static response"))
}

// ==================== PROPFIND ====================

pub async fn propfind_handler(
    state: &GatewayState,
    url_path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> HandlerResult {
    let depth = parse_depth(headers.get("Depth").and_then(|v| v.to_str().ok()))
        .map_err(WebDavError::Gate)?;
    let body_str = String::from_utf8_lossy(body);
    let extended = xml::wants_extended_namespaces(&body_str);
    let prefix = &state.config.url_prefix;
    let youngest = state
        .source
        .get_latest_changeset(&state.creds)
        .await
        .map_err(GateError::Upstream)?;

    match RequestPath::parse(&state.config, url_path)? {
        RequestPath::Vcc => {
            let responses = vec![xml::PropResponse::ok(format!("{prefix}/!svn/vcc/default"))
                .prop("D:checked-in", format!("{prefix}/!svn/bln/{youngest}"))];
            xml_response(207, xml::multistatus(&responses, extended)?)
        }
        RequestPath::Baseline { revision } => {
            let responses = vec![xml::PropResponse::ok(format!("{prefix}/!svn/bln/{revision}"))
                .prop("D:baseline-collection", format!("{prefix}/!svn/bc/{revision}/"))
                .prop("D:version-name", revision.to_string())];
            xml_response(207, xml::multistatus(&responses, extended)?)
        }
        RequestPath::BaselineCollection { revision, server_path }
        | RequestPath::Version { revision, server_path } => {
            resource_propfind(state, revision, &server_path, depth, extended).await
        }
        RequestPath::Plain { server_path } => {
            resource_propfind(state, youngest, &server_path, depth, extended).await
        }
        other => Err(WebDavError::Gate(GateError::UnsupportedPath(format!(
            "PROPFIND on {other:?}"
        )))),
    }
}

async fn resource_propfind(
    state: &GatewayState,
    revision: i64,
    server_path: &str,
    depth: Recursion,
    extended: bool,
) -> HandlerResult {
    let prefix = &state.config.url_prefix;
    let items = state
        .cache
        .query_items(revision, server_path, depth)
        .await?;
    if items.is_empty() && !svngate_core::pathing::is_server_root(server_path) {
        return Err(WebDavError::Gate(GateError::NotFound(server_path.to_string())));
    }

    let mut responses = Vec::new();
    if svngate_core::pathing::is_server_root(server_path) {
        responses.push(
            xml::PropResponse::ok(format!("{prefix}/"))
                .empty_prop("D:resourcetype")
                .prop("D:version-name", revision.to_string())
                .prop(
                    "D:version-controlled-configuration",
                    format!("{prefix}/!svn/vcc/default"),
                )
                .prop("V:repository-uuid", state.instance_uuid.clone()),
        );
    }
    for item in items {
        let rel = item.remote_name.trim_start_matches("$/");
        let href = format!("{prefix}/{}", svngate_core::pathing::encode_percent(rel));
        let mut response = xml::PropResponse::ok(href)
            .prop("D:version-name", item.changeset_id.to_string())
            .prop("D:creator-displayname", item.author.clone())
            .prop(
                "D:getlastmodified",
                item.remote_date.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            )
            .prop(
                "D:checked-in",
                format!(
                    "{prefix}/!svn/ver/{}/{}",
                    item.changeset_id,
                    svngate_core::pathing::encode_percent(rel)
                ),
            )
            .prop("V:repository-uuid", state.instance_uuid.clone());
        if item.kind == SourceItemKind::Folder {
            response = response.empty_prop("D:resourcetype");
        } else {
            response = response.prop("D:getcontentlength", item.size.to_string());
        }
        responses.push(response);
    }
    xml_response(207, xml::multistatus(&responses, extended)?)
}

// ==================== REPORT ====================

pub async fn report_handler(state: &GatewayState, url_path: &str, body: &[u8]) -> HandlerResult {
    let body_str = String::from_utf8_lossy(body);
    if body_str.contains("update-report") {
        let xml_body = report::update_report(state, url_path, &body_str).await?;
        return xml_response(200, xml_body);
    }
    Err(WebDavError::Gate(GateError::UnsupportedPath(
        "unrecognized report body".to_string(),
    )))
}

// ==================== MKACTIVITY ====================

pub async fn mkactivity_handler(
    state: &GatewayState,
    url_path: &str,
    headers: &HeaderMap,
) -> HandlerResult {
    let RequestPath::Activity { id } = RequestPath::parse(&state.config, url_path)? else {
        return Err(WebDavError::InvalidRequest(
            "MKACTIVITY outside the activity collection".into(),
        ));
    };
    let id = if id.is_empty() { Uuid::new_v4().to_string() } else { id };
    let base = state
        .source
        .get_latest_changeset(&state.creds)
        .await
        .map_err(GateError::Upstream)?;

    let mut activities = state.activities.write().await;
    activities.insert(
        id.clone(),
        ActivityState {
            id: id.clone(),
            author: state.creds.username.clone(),
            base_changeset: base,
            created_at: Utc::now().timestamp(),
        },
    );
    drop(activities);
    info!(activity = %id, base, "activity created");

    let host = headers
        .get("Host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    Ok(Response::builder()
        .status(201)
        .header(
            "Location",
            format!("http://{host}{}/!svn/act/{id}", state.config.url_prefix),
        )
        .header("Cache-Control", "no-cache")
        .body(Full::new(Bytes::new()))
        .expect("static response"))
}

// ==================== MKCOL ====================

pub async fn mkcol_handler(state: &GatewayState, url_path: &str) -> HandlerResult {
    let RequestPath::Working { activity, server_path } =
        RequestPath::parse(&state.config, url_path)?
    else {
        return Err(WebDavError::Gate(GateError::UnsupportedPath(
            "MKCOL requires a working-resource URL".into(),
        )));
    };
    ensure_activity(state, &activity).await?;
    state
        .source
        .make_collection(&state.creds, &activity, &server_path)
        .await
        .map_err(GateError::Upstream)?;
    empty_response(201)
}

// ==================== DELETE ====================

pub async fn delete_handler(state: &GatewayState, url_path: &str) -> HandlerResult {
    match RequestPath::parse(&state.config, url_path)? {
        RequestPath::Activity { id } => {
            let removed = state.activities.write().await.remove(&id).is_some();
            if removed {
                debug!(activity = %id, "activity aborted");
                empty_response(204)
            } else {
                Err(WebDavError::Gate(GateError::NotFound(format!("activity {id}"))))
            }
        }
        RequestPath::Working { activity, server_path } => {
            ensure_activity(state, &activity).await?;
            let existed = state
                .source
                .delete_item(&state.creds, &activity, &server_path)
                .await
                .map_err(GateError::Upstream)?;
            if existed {
                empty_response(204)
            } else {
                Err(WebDavError::Gate(GateError::NotFound(server_path)))
            }
        }
        _ => Err(WebDavError::Gate(GateError::UnsupportedPath(
            "DELETE requires an activity or working-resource URL".into(),
        ))),
    }
}

// ==================== PUT ====================

pub async fn put_handler(
    state: &GatewayState,
    url_path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let RequestPath::Working { activity, server_path } =
        RequestPath::parse(&state.config, url_path)?
    else {
        return Err(WebDavError::Gate(GateError::UnsupportedPath(
            "PUT requires a working-resource URL".into(),
        )));
    };
    ensure_activity(state, &activity).await?;

    // End-to-end MD5 guards. An absent header skips the corresponding
    // check to accommodate clients that never send one.
    if let Some(base_md5) = header_str(headers, "X-SVN-Base-Fulltext-MD5") {
        let youngest = state
            .source
            .get_latest_changeset(&state.creds)
            .await
            .map_err(GateError::Upstream)?;
        if let Some(item) = state.cache.query_item(youngest, &server_path).await? {
            let current = state
                .source
                .read_file(&state.creds, &item)
                .await
                .map_err(GateError::Upstream)?;
            let actual = hex::encode(Md5::digest(&current));
            if !actual.eq_ignore_ascii_case(base_md5) {
                return Err(WebDavError::Gate(GateError::ChecksumMismatch {
                    expected: base_md5.to_string(),
                    actual,
                }));
            }
        }
    }
    if let Some(result_md5) = header_str(headers, "X-SVN-Result-Fulltext-MD5") {
        let actual = hex::encode(Md5::digest(&body));
        if !actual.eq_ignore_ascii_case(result_md5) {
            return Err(WebDavError::Gate(GateError::ChecksumMismatch {
                expected: result_md5.to_string(),
                actual,
            }));
        }
    }

    let created = state
        .source
        .write_file(&state.creds, &activity, &server_path, body)
        .await
        .map_err(GateError::Upstream)?;
    if created {
        empty_response(201)
    } else {
        empty_response(204)
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ==================== GET / HEAD ====================

pub async fn get_handler(state: &GatewayState, url_path: &str) -> HandlerResult {
    let (revision, server_path) = match RequestPath::parse(&state.config, url_path)? {
        RequestPath::Plain { server_path } => {
            let youngest = state
                .source
                .get_latest_changeset(&state.creds)
                .await
                .map_err(GateError::Upstream)?;
            (youngest, server_path)
        }
        RequestPath::Version { revision, server_path }
        | RequestPath::BaselineCollection { revision, server_path } => (revision, server_path),
        RequestPath::Vcc => {
            let body = format!(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:href xmlns:D=\"DAV:\">{}/!svn/vcc/default</D:href>",
                state.config.url_prefix
            );
            return xml_response(200, body);
        }
        other => {
            return Err(WebDavError::Gate(GateError::UnsupportedPath(format!(
                "GET on {other:?}"
            ))))
        }
    };

    let item = state
        .cache
        .query_item(revision, &server_path)
        .await?
        .ok_or_else(|| GateError::NotFound(server_path.clone()))?;
    if item.kind == SourceItemKind::Folder {
        return Ok(Response::builder()
            .status(405)
            .header("Allow", "PROPFIND")
            .body(Full::new(Bytes::from("Use PROPFIND on collections")))
            .expect("static response"));
    }
    let content = state
        .source
        .read_file(&state.creds, &item)
        .await
        .map_err(GateError::Upstream)?;
    Ok(Response::builder()
        .status(200)
        .header("Content-Type", "application/octet-stream")
        .header("Content-Length", content.len().to_string())
        .body(Full::new(content))
        .expect("static response"))
}

pub async fn head_handler(state: &GatewayState, url_path: &str) -> HandlerResult {
    let response = get_handler(state, url_path).await?;
    let (mut parts, _) = response.into_parts();
    parts.headers.remove("Content-Length");
    Ok(Response::from_parts(parts, Full::new(Bytes::new())))
}

// ==================== PROPPATCH ====================

#[derive(Debug, Clone, PartialEq)]
pub enum PropPatchOp {
    Set { name: String, value: String },
    Remove { name: String },
}

/// Parse the set/remove operations out of a PROPPATCH body.
pub fn parse_proppatch(body: &str) -> Result<Vec<PropPatchOp>, WebDavError> {
    let mut reader = quick_xml::Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut ops = Vec::new();
    let mut in_set = false;
    let mut in_remove = false;
    let mut in_prop = false;
    let mut current: Option<(String, String)> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = local_name(e.name().as_ref());
                match name.as_str() {
                    "set" => in_set = true,
                    "remove" => in_remove = true,
                    "prop" => in_prop = true,
                    _ if in_prop && current.is_none() => {
                        current = Some((name, String::new()));
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                let name = local_name(e.name().as_ref());
                if in_prop && in_remove {
                    ops.push(PropPatchOp::Remove { name });
                } else if in_prop && in_set {
                    ops.push(PropPatchOp::Set {
                        name,
                        value: String::new(),
                    });
                }
            }
            Ok(Event::Text(ref t)) => {
                if let Some((_, value)) = current.as_mut() {
                    value.push_str(
                        &t.unescape()
                            .map_err(|e| WebDavError::Xml(e.to_string()))?,
                    );
                }
            }
            Ok(Event::End(ref e)) => {
                let name = local_name(e.name().as_ref());
                match name.as_str() {
                    "set" => in_set = false,
                    "remove" => in_remove = false,
                    "prop" => in_prop = false,
                    _ => {
                        if let Some((prop_name, value)) = current.take_if(|(n, _)| *n == name) {
                            if in_remove {
                                ops.push(PropPatchOp::Remove { name: prop_name });
                            } else if in_set {
                                ops.push(PropPatchOp::Set {
                                    name: prop_name,
                                    value,
                                });
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(WebDavError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(ops)
}

fn local_name(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

pub async fn proppatch_handler(state: &GatewayState, url_path: &str, body: &[u8]) -> HandlerResult {
    let body_str = String::from_utf8_lossy(body);
    let ops = parse_proppatch(&body_str)?;
    let extended = xml::wants_extended_namespaces(&body_str);

    match RequestPath::parse(&state.config, url_path)? {
        RequestPath::Activity { id } => {
            ensure_activity(state, &id).await?;
            for op in &ops {
                if let PropPatchOp::Set { name, value } = op {
                    if name == "log" {
                        state
                            .source
                            .set_activity_comment(&state.creds, &id, value)
                            .await
                            .map_err(GateError::Upstream)?;
                    }
                }
            }
        }
        RequestPath::Working { activity, server_path } => {
            ensure_activity(state, &activity).await?;
            for op in &ops {
                match op {
                    PropPatchOp::Set { name, value } => state
                        .source
                        .set_property(&state.creds, &activity, &server_path, name, value)
                        .await
                        .map_err(GateError::Upstream)?,
                    PropPatchOp::Remove { name } => state
                        .source
                        .remove_property(&state.creds, &activity, &server_path, name)
                        .await
                        .map_err(GateError::Upstream)?,
                }
            }
        }
        _ => {
            return Err(WebDavError::Gate(GateError::UnsupportedPath(
                "PROPPATCH requires an activity or working-resource URL".into(),
            )))
        }
    }

    let mut response = xml::PropResponse::ok(url_path.to_string());
    for op in &ops {
        let name = match op {
            PropPatchOp::Set { name, .. } | PropPatchOp::Remove { name } => name,
        };
        response = response.empty_prop(format!("S:{name}"));
    }
    xml_response(207, xml::multistatus(&[response], extended)?)
}

// ==================== MERGE ====================

pub async fn merge_handler(state: &GatewayState, body: &[u8]) -> HandlerResult {
    let body_str = String::from_utf8_lossy(body);
    let href = extract_text_between(&body_str, "<D:href>", "</D:href>")
        .ok_or_else(|| WebDavError::InvalidRequest("MERGE body without activity href".into()))?;
    let activity = href
        .rsplit('/')
        .find(|s| !s.is_empty())
        .ok_or_else(|| WebDavError::InvalidRequest("empty activity href".into()))?
        .to_string();
    let meta = ensure_activity(state, &activity).await?;

    let new_rev = state
        .source
        .commit_activity(&state.creds, &activity)
        .await
        .map_err(GateError::Upstream)?;
    state.activities.write().await.remove(&activity);
    info!(activity = %activity, changeset = new_rev, "activity committed");

    let prefix = &state.config.url_prefix;
    let now = Utc::now();
    let body = format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<D:merge-response xmlns:D=\"DAV:\">\n",
            "<D:updated-set>\n",
            "<D:response>\n",
            "<D:href>{prefix}/!svn/vcc/default</D:href>\n",
            "<D:propstat><D:prop>\n",
            "<D:resourcetype><D:baseline/></D:resourcetype>\n",
            "<D:version-name>{rev}</D:version-name>\n",
            "<D:creationdate>{date}</D:creationdate>\n",
            "<D:creator-displayname>{author}</D:creator-displayname>\n",
            "</D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat>\n",
            "</D:response>\n",
            "</D:updated-set>\n",
            "</D:merge-response>"
        ),
        prefix = prefix,
        rev = new_rev,
        date = now.format("%Y-%m-%dT%H:%M:%S.%6fZ"),
        author = escape_xml(&meta.author),
    );
    xml_response(200, body)
}

async fn ensure_activity(state: &GatewayState, id: &str) -> Result<ActivityState, WebDavError> {
    state
        .activities
        .read()
        .await
        .get(id)
        .cloned()
        .ok_or_else(|| WebDavError::Gate(GateError::NotFound(format!("activity {id}"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proppatch_set_and_remove() {
        let body = r#"<?xml version="1.0"?>
<D:propertyupdate xmlns:D="DAV:" xmlns:S="svn:">
  <D:set><D:prop><S:log>commit message</S:log></D:prop></D:set>
  <D:set><D:prop><S:mime-type>text/plain</S:mime-type></D:prop></D:set>
  <D:remove><D:prop><S:needs-lock/></D:prop></D:remove>
</D:propertyupdate>"#;
        let ops = parse_proppatch(body).unwrap();
        assert_eq!(
            ops,
            vec![
                PropPatchOp::Set {
                    name: "log".into(),
                    value: "commit message".into()
                },
                PropPatchOp::Set {
                    name: "mime-type".into(),
                    value: "text/plain".into()
                },
                PropPatchOp::Remove {
                    name: "needs-lock".into()
                },
            ]
        );
    }

    #[test]
    fn test_extract_text_between() {
        let s = "<D:href>/svn/!svn/act/abc</D:href>";
        assert_eq!(
            extract_text_between(s, "<D:href>", "</D:href>"),
            Some("/svn/!svn/act/abc")
        );
        assert_eq!(extract_text_between(s, "<x>", "</x>"), None);
    }

    #[test]
    fn test_local_name_strips_prefix() {
        assert_eq!(local_name(b"S:log"), "log");
        assert_eq!(local_name(b"log"), "log");
    }
}
