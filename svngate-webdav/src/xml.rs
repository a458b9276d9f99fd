//! DAV XML generation helpers.
//!
//! Envelopes carry the namespace triple (`DAV:`, the svn dialect namespace,
//! and its DAV extension namespace); the custom-properties namespace is added
//! only when the request body declared it.

use quick_xml::events::BytesText;
use quick_xml::writer::Writer;
use std::io::Cursor;

pub use svngate_core::pathing::{escape_xml, unescape_xml};

/// WebDAV namespace.
pub const DAV_NS: &str = "DAV:";

/// SVN dialect namespace used in report bodies.
pub const SVN_NS: &str = "svn:";

/// DAV extension namespace of the dialect.
pub const SVN_DAV_NS: &str = "http://subversion.tigris.org/xmlns/dav/";

/// Custom-properties namespace, emitted in extended-namespaces mode.
pub const CUSTOM_NS: &str = "http://subversion.tigris.org/xmlns/custom/";

/// Entry-property prefix the client expects on every reported item.
pub const ENTRY_PROP_PREFIX: &str = "svn:entry:";

/// Whether the request body opted into the custom-properties namespace.
pub fn wants_extended_namespaces(body: &str) -> bool {
    body.contains(CUSTOM_NS)
}

/// The dialect's error envelope: numeric code plus human-readable message.
pub fn error_envelope(code: u32, message: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<D:error xmlns:D=\"DAV:\" xmlns:m=\"http://apache.org/dav/xmlns\" ",
            "xmlns:C=\"svn:\">\n",
            "<C:error/>\n",
            "<m:human-readable errcode=\"{code}\">{message}</m:human-readable>\n",
            "</D:error>"
        ),
        code = code,
        message = escape_xml(message),
    )
}

/// One response inside a multistatus envelope.
#[derive(Debug, Clone)]
pub struct PropResponse {
    pub href: String,
    pub props: Vec<(String, Option<String>)>,
    pub status: String,
}

impl PropResponse {
    pub fn ok(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            props: Vec::new(),
            status: "HTTP/1.1 200 OK".to_string(),
        }
    }

    pub fn prop(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.push((name.into(), Some(value.into())));
        self
    }

    pub fn empty_prop(mut self, name: impl Into<String>) -> Self {
        self.props.push((name.into(), None));
        self
    }
}

/// Errors from XML generation.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Serialize a 207 multistatus body.
pub fn multistatus(responses: &[PropResponse], extended: bool) -> Result<String, XmlError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut attrs = vec![
        ("xmlns:D", DAV_NS),
        ("xmlns:S", SVN_NS),
        ("xmlns:V", SVN_DAV_NS),
    ];
    if extended {
        attrs.push(("xmlns:C", CUSTOM_NS));
    }
    writer
        .create_element("D:multistatus")
        .with_attributes(attrs)
        .write_inner_content(|w| {
            for response in responses {
                w.create_element("D:response").write_inner_content(|w| {
                    w.create_element("D:href")
                        .write_text_content(BytesText::new(&response.href))?;
                    w.create_element("D:propstat").write_inner_content(|w| {
                        w.create_element("D:prop").write_inner_content(|w| {
                            for (name, value) in &response.props {
                                match value {
                                    Some(value) => {
                                        w.create_element(name.as_str())
                                            .write_text_content(BytesText::new(value))?;
                                    }
                                    None => {
                                        w.create_element(name.as_str()).write_empty()?;
                                    }
                                }
                            }
                            Ok::<(), quick_xml::Error>(())
                        })?;
                        w.create_element("D:status")
                            .write_text_content(BytesText::new(&response.status))?;
                        Ok::<(), quick_xml::Error>(())
                    })?;
                    Ok::<(), quick_xml::Error>(())
                })?;
            }
            Ok::<(), quick_xml::Error>(())
        })
        .map_err(|e: quick_xml::Error| XmlError::Serialization(e.to_string()))?;

    let bytes = writer.into_inner().into_inner();
    let body = String::from_utf8(bytes).map_err(|e| XmlError::Serialization(e.to_string()))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{body}"))
}
