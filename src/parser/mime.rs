//! MIME body extraction: full-message parse with `mail-parser`, and a
//! part-wise fallback for protocol responses that never deliver the whole
//! message.

use mail_parser::{MessageParser, MessagePartId, MimeHeaders, PartType};
use serde::{Deserialize, Serialize};

use crate::model::attachment::AttachmentDescriptor;
use crate::parser::header::{decode_charset, HeaderMap};

/// One body part as delivered by a protocol client.
///
/// `content` is already transfer-decoded (base64/quoted-printable removed)
/// but still in its declared charset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPart {
    /// Part path in the body structure (`"1"`, `"2.1"`), when known.
    pub path: Option<String>,
    /// Declared type, e.g. `"text/plain"`.
    pub content_type: String,
    pub charset: Option<String>,
    /// `"inline"` or `"attachment"`.
    pub disposition: Option<String>,
    pub filename: Option<String>,
    pub content_id: Option<String>,
    #[serde(skip)]
    pub content: Vec<u8>,
}

/// A node of a separately fetched body-structure tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BodyStructure {
    pub path: String,
    pub content_type: String,
    pub disposition: Option<String>,
    pub filename: Option<String>,
    pub content_id: Option<String>,
    pub size: u64,
    #[serde(default)]
    pub children: Vec<BodyStructure>,
}

impl BodyStructure {
    /// Depth-first walk over this node and its descendants.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a BodyStructure)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    fn is_multipart(&self) -> bool {
        self.content_type.to_lowercase().starts_with("multipart/")
    }
}

/// Everything a body can contribute to a message record.
#[derive(Debug, Clone, Default)]
pub struct ExtractedBody {
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentDescriptor>,
    /// Headers found in the raw message, if it was available.
    pub headers: HeaderMap,
    /// Provenance summary of the MIME tree.
    pub structure: serde_json::Value,
    /// Some part is a `message/delivery-status` report.
    pub has_delivery_status: bool,
}

const DELIVERY_STATUS: &str = "message/delivery-status";

fn is_delivery_status(content_type: &str) -> bool {
    content_type.trim().to_ascii_lowercase().starts_with(DELIVERY_STATUS)
}

/// Parse a complete raw message and extract text, HTML and attachments.
///
/// Returns `None` when `mail-parser` cannot make sense of the bytes, so the
/// caller can fall back to part-wise extraction.
pub fn extract_full(raw_message: &[u8]) -> Option<ExtractedBody> {
    let msg = MessageParser::default().parse(raw_message)?;

    // In multipart/mixed every inline text part is listed under both bodies,
    // so pick by the part's own type before falling back to conversion.
    let typed_body = |ids: &[MessagePartId], want_html: bool| {
        ids.iter()
            .filter_map(|id| msg.part(*id))
            .find_map(|part| match (&part.body, want_html) {
                (PartType::Html(s), true) | (PartType::Text(s), false) => Some(s.to_string()),
                _ => None,
            })
    };
    let html = typed_body(&msg.html_body, true).or_else(|| msg.body_html(0).map(|s| s.into_owned()));
    let text = typed_body(&msg.text_body, false)
        .or_else(|| msg.body_text(0).map(|s| s.into_owned()))
        .or_else(|| html.as_deref().map(html_to_text));

    let attachments = msg
        .attachments()
        .enumerate()
        .map(|(idx, part)| {
            let content = part.contents();
            AttachmentDescriptor {
                filename: part
                    .attachment_name()
                    .map(String::from)
                    .unwrap_or_else(|| format!("attachment_{idx}")),
                content_type: part
                    .content_type()
                    .map(mime_string)
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: content.len() as u64,
                content_id: part.content_id().map(|id| id.trim_matches(['<', '>']).to_string()),
                is_inline: part
                    .content_disposition()
                    .is_some_and(|d| d.ctype().eq_ignore_ascii_case("inline")),
                data: Some(content.to_vec()),
            }
        })
        .collect();

    let has_delivery_status = msg
        .parts
        .iter()
        .filter_map(|part| part.content_type())
        .any(|ct| mime_string(ct) == DELIVERY_STATUS);

    let structure = serde_json::Value::Array(
        msg.parts
            .iter()
            .enumerate()
            .map(|(idx, part)| {
                serde_json::json!({
                    "index": idx,
                    "content_type": part.content_type().map(mime_string),
                    "disposition": part.content_disposition().map(|d| d.ctype().to_string()),
                    "filename": part.attachment_name(),
                    "size": part.contents().len(),
                })
            })
            .collect(),
    );

    Some(ExtractedBody {
        text,
        html,
        attachments,
        headers: HeaderMap::parse(raw_message),
        structure,
        has_delivery_status,
    })
}

/// Extract from individually delivered parts, then add any attachment the
/// body structure announces that the parts did not carry.
pub fn extract_parts(parts: &[RawPart], structure: Option<&BodyStructure>) -> ExtractedBody {
    let mut text: Option<String> = None;
    let mut html: Option<String> = None;
    let mut attachments: Vec<AttachmentDescriptor> = Vec::new();
    let mut seen_paths: Vec<&str> = Vec::new();
    let mut has_delivery_status = parts.iter().any(|p| is_delivery_status(&p.content_type));

    for (idx, part) in parts.iter().enumerate() {
        let ctype = part.content_type.trim().to_lowercase();
        let is_attachment = part.filename.is_some()
            || part
                .disposition
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case("attachment"))
            || !(ctype.starts_with("text/plain") || ctype.starts_with("text/html"));

        if let Some(path) = part.path.as_deref() {
            seen_paths.push(path);
        }

        if is_attachment {
            if ctype.starts_with("multipart/") {
                continue;
            }
            attachments.push(AttachmentDescriptor {
                filename: part
                    .filename
                    .clone()
                    .unwrap_or_else(|| format!("attachment_{idx}")),
                content_type: if ctype.is_empty() {
                    "application/octet-stream".to_string()
                } else {
                    ctype
                },
                size: part.content.len() as u64,
                content_id: part
                    .content_id
                    .as_deref()
                    .map(|id| id.trim_matches(['<', '>']).to_string()),
                is_inline: part
                    .disposition
                    .as_deref()
                    .is_some_and(|d| d.eq_ignore_ascii_case("inline")),
                data: Some(part.content.clone()),
            });
            continue;
        }

        let decoded = decode_charset(part.charset.as_deref().unwrap_or("utf-8"), &part.content);
        let slot = if ctype.starts_with("text/html") {
            &mut html
        } else {
            &mut text
        };
        // First part of each kind wins, like the full parse.
        if slot.is_none() {
            *slot = Some(decoded);
        }
    }

    if let Some(tree) = structure {
        tree.walk(&mut |node| {
            has_delivery_status |= is_delivery_status(&node.content_type);
            if node.is_multipart() || seen_paths.contains(&node.path.as_str()) {
                return;
            }
            let announced = node.filename.is_some()
                || node
                    .disposition
                    .as_deref()
                    .is_some_and(|d| d.eq_ignore_ascii_case("attachment"));
            if !announced {
                return;
            }
            let filename = node.filename.clone().unwrap_or_else(|| format!("attachment_{}", node.path));
            let content_type = node.content_type.to_lowercase();
            if attachments
                .iter()
                .any(|a| a.filename == filename && a.content_type == content_type)
            {
                return;
            }
            attachments.push(AttachmentDescriptor {
                filename,
                content_type,
                size: node.size,
                content_id: node
                    .content_id
                    .as_deref()
                    .map(|id| id.trim_matches(['<', '>']).to_string()),
                is_inline: node
                    .disposition
                    .as_deref()
                    .is_some_and(|d| d.eq_ignore_ascii_case("inline")),
                data: None,
            });
        });
    }

    if text.is_none() {
        text = html.as_deref().map(html_to_text);
    }

    ExtractedBody {
        text,
        html,
        attachments,
        headers: HeaderMap::new(),
        structure: structure
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or(serde_json::Value::Null),
        has_delivery_status,
    }
}

/// `"type/subtype"` from a parsed content type.
fn mime_string(ct: &mail_parser::ContentType<'_>) -> String {
    match ct.subtype() {
        Some(sub) => format!("{}/{}", ct.ctype(), sub).to_lowercase(),
        None => ct.ctype().to_lowercase(),
    }
}

/// Convert HTML to plain text for the text body of HTML-only mail.
///
/// Block elements become line breaks, scripts and styles are dropped,
/// common entities are decoded and blank lines are collapsed.
pub fn html_to_text(html: &str) -> String {
    let html = remove_tag_block(&remove_tag_block(html, "script"), "style");

    let mut out = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or("")
                    .to_lowercase();
                if matches!(
                    name.as_str(),
                    "br" | "p" | "div" | "tr" | "li" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
                ) {
                    out.push('\n');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => out.push(ch),
        }
    }

    let out = out
        .replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");

    let mut cleaned = String::with_capacity(out.len());
    let mut prev_blank = false;
    for line in out.lines().map(str::trim) {
        if line.is_empty() {
            if !prev_blank {
                cleaned.push('\n');
            }
            prev_blank = true;
        } else {
            cleaned.push_str(line);
            cleaned.push('\n');
            prev_blank = false;
        }
    }
    cleaned.trim().to_string()
}

/// Remove an entire tag block (e.g. `<script>…</script>`).
///
/// Matching folds ASCII case only, so offsets in `lower` stay valid in `html`.
fn remove_tag_block(html: &str, tag: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");

    let mut result = String::with_capacity(html.len());
    let mut pos = 0;
    while let Some(start) = lower[pos..].find(&open).map(|i| i + pos) {
        result.push_str(&html[pos..start]);
        match lower[start..].find(&close) {
            Some(end) => pos = start + end + close.len(),
            None => return result,
        }
    }
    result.push_str(&html[pos..]);
    result
}
