//! The update-report generator.
//!
//! Parses the client's reported working-copy state out of the request body,
//! replays the changeset range through the diff engine, then walks the
//! resulting operation tree while the item loader prefetches file content in
//! the background.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use quick_xml::events::Event;
use tracing::{debug, info};

use svngate_core::pathing::{self, encode_percent, escape_xml};
use svngate_core::{
    collect_file_loads, ClientState, FileNode, FolderNode, GateError, ItemLoader, Recursion,
    SourceItemKind, TreeNode, UpdateDiffEngine,
};

use crate::{GatewayState, RequestPath, WebDavError};

/// One `entry` element of an update-report body.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub rel_path: String,
    pub revision: i64,
    pub start_empty: bool,
}

/// Parsed update-report request.
#[derive(Debug, Clone, Default)]
pub struct UpdateReportRequest {
    pub src_path: Option<String>,
    pub target_revision: Option<i64>,
    pub update_target: Option<String>,
    pub entries: Vec<ReportEntry>,
    pub missing: Vec<String>,
}

impl UpdateReportRequest {
    pub fn from_xml(body: &str) -> Result<Self, WebDavError> {
        let mut reader = quick_xml::Reader::from_str(body);
        reader.config_mut().trim_text(true);

        let mut request = UpdateReportRequest::default();
        let mut element = String::new();
        let mut entry_rev: i64 = 0;
        let mut entry_start_empty = false;
        let mut entry_text = String::new();
        let mut buf = Vec::new();

        let parse_entry_attrs = |e: &quick_xml::events::BytesStart<'_>| {
            let mut rev = 0;
            let mut start_empty = false;
            for attr in e.attributes().flatten() {
                let key = local_name(attr.key.as_ref());
                let value = String::from_utf8_lossy(&attr.value).to_string();
                match key.as_str() {
                    "rev" => rev = value.parse().unwrap_or(0),
                    "start-empty" => start_empty = value == "true",
                    _ => {}
                }
            }
            (rev, start_empty)
        };

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    element = local_name(e.name().as_ref());
                    if element == "entry" {
                        (entry_rev, entry_start_empty) = parse_entry_attrs(e);
                        entry_text.clear();
                    }
                }
                Ok(Event::Empty(ref e)) => {
                    // a self-closing <S:entry rev="N"/> names the report root
                    if local_name(e.name().as_ref()) == "entry" {
                        let (rev, start_empty) = parse_entry_attrs(e);
                        request.entries.push(ReportEntry {
                            rel_path: String::new(),
                            revision: rev,
                            start_empty,
                        });
                    }
                }
                Ok(Event::Text(ref t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| WebDavError::Xml(e.to_string()))?
                        .into_owned();
                    match element.as_str() {
                        "src-path" => request.src_path = Some(text),
                        "target-revision" => {
                            request.target_revision = text.parse().ok();
                        }
                        "update-target" => request.update_target = Some(text),
                        "entry" => entry_text.push_str(&text),
                        "missing" => request.missing.push(text),
                        _ => {}
                    }
                }
                Ok(Event::End(ref e)) => {
                    if local_name(e.name().as_ref()) == "entry" {
                        request.entries.push(ReportEntry {
                            rel_path: entry_text.clone(),
                            revision: entry_rev,
                            start_empty: entry_start_empty,
                        });
                        entry_text.clear();
                    }
                    element.clear();
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(WebDavError::Xml(e.to_string())),
                _ => {}
            }
            buf.clear();
        }
        Ok(request)
    }
}

fn local_name(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

/// Server path named by the `src-path` URL of an update-report.
fn src_path_to_server(state: &GatewayState, src: &str) -> Result<String, WebDavError> {
    let path = match src.find("://") {
        Some(scheme_end) => {
            let rest = &src[scheme_end + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => src,
    };
    match RequestPath::parse(&state.config, path)? {
        RequestPath::Plain { server_path } => Ok(server_path),
        other => Err(WebDavError::Gate(GateError::UnsupportedPath(format!(
            "src-path resolves to {other:?}"
        )))),
    }
}

/// Run an update report end to end and return the response XML.
pub async fn update_report(
    state: &GatewayState,
    url_path: &str,
    body: &str,
) -> Result<String, WebDavError> {
    let request = UpdateReportRequest::from_xml(body)?;

    let mut checkout_root = match &request.src_path {
        Some(src) => src_path_to_server(state, src)?,
        None => match RequestPath::parse(&state.config, url_path)? {
            RequestPath::Plain { server_path } => server_path,
            RequestPath::Version { server_path, .. } => server_path,
            other => {
                return Err(WebDavError::Gate(GateError::UnsupportedPath(format!(
                    "REPORT on {other:?}"
                ))))
            }
        },
    };
    if let Some(target) = request
        .update_target
        .as_deref()
        .filter(|t| !t.is_empty())
    {
        checkout_root = pathing::join(&checkout_root, target);
    }

    let target_revision = match request.target_revision {
        Some(rev) => rev,
        None => state
            .source
            .get_latest_changeset(&state.creds)
            .await
            .map_err(GateError::Upstream)?,
    };
    let from_revision = request
        .entries
        .iter()
        .find(|e| e.rel_path.is_empty())
        .map(|e| e.revision)
        .unwrap_or(target_revision);

    let mut client = ClientState::new(state.policy);
    for entry in &request.entries {
        if entry.start_empty {
            continue;
        }
        let path = if entry.rel_path.is_empty() {
            checkout_root.clone()
        } else {
            pathing::join(&checkout_root, &entry.rel_path)
        };
        client.add_existing(path, entry.revision);
    }
    for rel in &request.missing {
        client.add_missing(pathing::join(&checkout_root, rel), "reported");
    }

    info!(
        checkout_root = %checkout_root,
        from = from_revision,
        target = target_revision,
        "update report"
    );

    let forward = target_revision >= from_revision;
    let mut history = if forward {
        state
            .source
            .query_history(&state.creds, &checkout_root, from_revision + 1, target_revision)
            .await
            .map_err(GateError::Upstream)?
    } else {
        let mut h = state
            .source
            .query_history(&state.creds, &checkout_root, target_revision + 1, from_revision)
            .await
            .map_err(GateError::Upstream)?;
        h.reverse();
        h
    };
    // caller-supplied order is the contract; make it explicit for forward
    if forward {
        history.sort_by_key(|cs| cs.id);
    }

    let mut engine = UpdateDiffEngine::new(
        state.cache.clone(),
        state.source.clone(),
        state.creds.clone(),
        checkout_root.clone(),
        target_revision,
        client,
    );
    let mut root = engine.new_root();
    engine.replay(&mut root, &history, forward).await?;
    engine.finish(&mut root).await?;

    expand_added_folders(state, &mut root, target_revision).await?;

    let plan = collect_file_loads(&root);
    let loader = Arc::new(ItemLoader::new(
        state.source.clone(),
        state.creds.clone(),
        state.loader_limits.clone(),
    ));
    let producer = {
        let loader = loader.clone();
        tokio::spawn(async move { loader.start(plan).await })
    };

    let rob_timeout = state.loader_limits.consumption_step;
    let generated = generate_xml(
        state,
        &root,
        &checkout_root,
        from_revision,
        target_revision,
        &loader,
        rob_timeout,
    )
    .await;

    if generated.is_err() {
        loader.cancel();
    }
    let produced = producer
        .await
        .map_err(|e| WebDavError::Internal(format!("loader task failed: {e}")))?;
    let body = generated?;
    match produced {
        Ok(()) | Err(GateError::Cancelled) => {}
        Err(err) => return Err(WebDavError::Gate(err)),
    }
    Ok(body)
}

/// Fill in the contents of freshly added folders (renames and branch-style
/// adds carry a single change record for the folder itself).
async fn expand_added_folders(
    state: &GatewayState,
    root: &mut FolderNode,
    target_revision: i64,
) -> Result<(), WebDavError> {
    fn expand<'a>(
        state: &'a GatewayState,
        children: &'a mut Vec<TreeNode>,
        target_revision: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebDavError>> + Send + 'a>> {
        Box::pin(async move {
            for child in children.iter_mut() {
                let expandable = matches!(child, TreeNode::Folder(f) if !f.edit);
                if expandable {
                    let name = child.name().to_string();
                    let listed = state
                        .cache
                        .query_items(target_revision, &name, Recursion::OneLevel)
                        .await?;
                    if let TreeNode::Folder(folder) = child {
                        for item in listed {
                            if state.policy.matches(&item.remote_name, &name)
                                || pathing::is_property_folder(&item.remote_name)
                                || pathing::is_property_path(&item.remote_name)
                            {
                                continue;
                            }
                            if folder.position_of(&item.remote_name, state.policy).is_some() {
                                continue;
                            }
                            let node = match item.kind {
                                SourceItemKind::File => {
                                    TreeNode::File(FileNode::from_source(&item, false))
                                }
                                SourceItemKind::Folder => {
                                    let mut sub = FolderNode::from_source(&item, false);
                                    sub.edit = false;
                                    TreeNode::Folder(sub)
                                }
                            };
                            folder.attach(node);
                        }
                    }
                }
                if let Some(grandchildren) = child.children_mut() {
                    expand(state, grandchildren, target_revision).await?;
                }
            }
            Ok(())
        })
    }
    expand(state, &mut root.children, target_revision).await
}

#[allow(clippy::too_many_arguments)]
async fn generate_xml(
    state: &GatewayState,
    root: &FolderNode,
    checkout_root: &str,
    from_revision: i64,
    target_revision: i64,
    loader: &ItemLoader,
    rob_timeout: Duration,
) -> Result<String, WebDavError> {
    let mut out = String::with_capacity(4096);
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<S:update-report xmlns:S=\"svn:\" xmlns:V=\"http://subversion.tigris.org/xmlns/dav/\" xmlns:D=\"DAV:\" send-all=\"true\">\n",
    );
    out.push_str(&format!("<S:target-revision rev=\"{target_revision}\"/>\n"));
    out.push_str(&format!("<S:open-directory rev=\"{from_revision}\">\n"));
    push_checked_in(&mut out, state, target_revision, checkout_root);
    push_entry_props(&mut out, state, target_revision, &root.meta.author, &root.meta.last_modified);

    emit_children(state, &mut out, &root.children, loader, rob_timeout).await?;

    out.push_str("</S:open-directory>\n");
    out.push_str("</S:update-report>\n");
    debug!(bytes = out.len(), "update report generated");
    Ok(out)
}

fn push_checked_in(out: &mut String, state: &GatewayState, revision: i64, server_path: &str) {
    let rel = server_path.trim_start_matches("$/");
    out.push_str(&format!(
        "<D:checked-in><D:href>{prefix}/!svn/ver/{revision}/{path}</D:href></D:checked-in>\n",
        prefix = state.config.url_prefix,
        path = encode_percent(rel),
    ));
}

fn push_entry_props(
    out: &mut String,
    state: &GatewayState,
    revision: i64,
    author: &str,
    date: &chrono::DateTime<chrono::Utc>,
) {
    out.push_str(&format!(
        "<S:set-prop name=\"svn:entry:committed-rev\">{revision}</S:set-prop>\n"
    ));
    out.push_str(&format!(
        "<S:set-prop name=\"svn:entry:committed-date\">{}</S:set-prop>\n",
        date.format("%Y-%m-%dT%H:%M:%S.%6fZ")
    ));
    if !author.is_empty() {
        out.push_str(&format!(
            "<S:set-prop name=\"svn:entry:last-author\">{}</S:set-prop>\n",
            escape_xml(author)
        ));
    }
    out.push_str(&format!(
        "<S:set-prop name=\"svn:entry:uuid\">{}</S:set-prop>\n",
        state.instance_uuid
    ));
}

/// Custom properties attached to a node via its property blob.
async fn node_properties(
    state: &GatewayState,
    property_source: Option<&svngate_core::SourceItem>,
    inline: &HashMap<String, String>,
) -> Result<Vec<(String, String)>, WebDavError> {
    let mut props: Vec<(String, String)> =
        inline.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    if let Some(blob) = property_source {
        let data = state
            .source
            .read_file(&state.creds, blob)
            .await
            .map_err(GateError::Upstream)?;
        if let Ok(map) = serde_json::from_slice::<HashMap<String, String>>(&data) {
            for (k, v) in map {
                props.push((k, v));
            }
        }
    }
    props.sort();
    Ok(props)
}

fn emit_children<'a>(
    state: &'a GatewayState,
    out: &'a mut String,
    children: &'a [TreeNode],
    loader: &'a ItemLoader,
    rob_timeout: Duration,
) -> Pin<Box<dyn Future<Output = Result<(), WebDavError>> + Send + 'a>> {
    Box::pin(async move {
        for child in children {
            let name = leaf_name(child.name());
            match child {
                TreeNode::DeleteFile { .. } | TreeNode::DeleteFolder(_) => {
                    out.push_str(&format!(
                        "<S:delete-entry name=\"{}\"/>\n",
                        escape_xml(&name)
                    ));
                }
                TreeNode::Missing { .. } => {
                    out.push_str(&format!(
                        "<S:absent-file name=\"{}\"/>\n",
                        escape_xml(&name)
                    ));
                }
                TreeNode::File(file) => {
                    emit_file(state, out, file, &name, loader, rob_timeout).await?;
                }
                TreeNode::Folder(folder) => {
                    let tag = if folder.edit { "open-directory" } else { "add-directory" };
                    if folder.edit {
                        out.push_str(&format!(
                            "<S:open-directory name=\"{}\" rev=\"{}\">\n",
                            escape_xml(&name),
                            folder.meta.revision()
                        ));
                    } else {
                        out.push_str(&format!(
                            "<S:add-directory name=\"{}\">\n",
                            escape_xml(&name)
                        ));
                    }
                    push_checked_in(out, state, folder.meta.revision().max(1), &folder.meta.name);
                    push_entry_props(
                        out,
                        state,
                        folder.meta.revision(),
                        &folder.meta.author,
                        &folder.meta.last_modified,
                    );
                    for (prop, value) in
                        node_properties(state, folder.property_source.as_ref(), &folder.meta.properties)
                            .await?
                    {
                        out.push_str(&format!(
                            "<S:set-prop name=\"{}\">{}</S:set-prop>\n",
                            escape_xml(&prop),
                            escape_xml(&value)
                        ));
                    }
                    emit_children(state, out, &folder.children, loader, rob_timeout).await?;
                    out.push_str(&format!("</S:{tag}>\n"));
                }
                // Stubs are resolved before hand-off; a survivor would mean
                // the engine's finish pass was skipped.
                TreeNode::Stub(stub) => {
                    out.push_str(&format!(
                        "<S:open-directory name=\"{}\" rev=\"{}\">\n",
                        escape_xml(&name),
                        stub.meta.revision()
                    ));
                    emit_children(state, out, &stub.children, loader, rob_timeout).await?;
                    out.push_str("</S:open-directory>\n");
                }
            }
        }
        Ok(())
    })
}

async fn emit_file(
    state: &GatewayState,
    out: &mut String,
    file: &FileNode,
    name: &str,
    loader: &ItemLoader,
    rob_timeout: Duration,
) -> Result<(), WebDavError> {
    if file.edit {
        out.push_str(&format!(
            "<S:open-file name=\"{}\" rev=\"{}\">\n",
            escape_xml(name),
            file.meta.revision()
        ));
    } else {
        out.push_str(&format!("<S:add-file name=\"{}\">\n", escape_xml(name)));
    }
    push_checked_in(out, state, file.meta.revision(), &file.meta.name);
    push_entry_props(
        out,
        state,
        file.meta.revision(),
        &file.meta.author,
        &file.meta.last_modified,
    );
    for (prop, value) in
        node_properties(state, file.property_source.as_ref(), &file.meta.properties).await?
    {
        out.push_str(&format!(
            "<S:set-prop name=\"{}\">{}</S:set-prop>\n",
            escape_xml(&prop),
            escape_xml(&value)
        ));
    }

    let robbed = loader.try_rob(&file.content, rob_timeout).await?;
    if robbed.got_data {
        out.push_str("<S:txdelta>");
        out.push_str(&robbed.base64);
        out.push_str("</S:txdelta>\n");
        if let Some(md5) = &robbed.md5 {
            out.push_str(&format!(
                "<S:prop><V:md5-checksum>{md5}</V:md5-checksum></S:prop>\n"
            ));
        }
    } else {
        // The fetch failed upstream; the report cannot be completed.
        return Err(WebDavError::Gate(GateError::NotFound(format!(
            "content for {}",
            file.meta.name
        ))));
    }

    if file.edit {
        out.push_str("</S:open-file>\n");
    } else {
        out.push_str("</S:add-file>\n");
    }
    Ok(())
}

fn leaf_name(path: &str) -> String {
    pathing::split(path).1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_report_body() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<S:update-report xmlns:S="svn:">
<S:src-path>http://localhost:8080/svn/Proj</S:src-path>
<S:target-revision>12</S:target-revision>
<S:entry rev="9"></S:entry>
<S:entry rev="9">dir/file.c</S:entry>
<S:missing>dir/gone.c</S:missing>
</S:update-report>"#;
        let parsed = UpdateReportRequest::from_xml(body).unwrap();
        assert_eq!(parsed.src_path.as_deref(), Some("http://localhost:8080/svn/Proj"));
        assert_eq!(parsed.target_revision, Some(12));
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].rel_path, "");
        assert_eq!(parsed.entries[0].revision, 9);
        assert_eq!(parsed.entries[1].rel_path, "dir/file.c");
        assert_eq!(parsed.missing, vec!["dir/gone.c"]);
    }

    #[test]
    fn test_parse_entry_start_empty() {
        let body = r#"<S:update-report xmlns:S="svn:">
<S:entry rev="4" start-empty="true"></S:entry>
</S:update-report>"#;
        let parsed = UpdateReportRequest::from_xml(body).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert!(parsed.entries[0].start_empty);
        assert_eq!(parsed.entries[0].revision, 4);
    }

    #[test]
    fn test_leaf_name() {
        assert_eq!(leaf_name("$/a/b/c.txt"), "c.txt");
        assert_eq!(leaf_name("$/top"), "top");
    }
}
