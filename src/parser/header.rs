//! RFC 5322 header handling: folding, encoded-words (RFC 2047), message-ID
//! lists and date parsing.

use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

/// Case-insensitive, order-preserving header multimap.
///
/// Names are stored lower-cased; values are unfolded and RFC 2047-decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the header block at the start of `raw` (stops at the first blank line).
    pub fn parse(raw: &[u8]) -> Self {
        let text = decode_header_bytes(raw);
        let block = match (text.find("\r\n\r\n"), text.find("\n\n")) {
            (Some(a), Some(b)) => &text[..a.min(b)],
            (Some(a), None) => &text[..a],
            (None, Some(b)) => &text[..b],
            (None, None) => &text[..],
        };
        Self::from_pairs(unfold_headers(block))
    }

    /// Build from `(name, value)` pairs, e.g. a protocol client's header list.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map = Self::new();
        for (name, value) in pairs {
            map.insert(name.as_ref(), value.as_ref());
        }
        map
    }

    /// Append a header (existing values with the same name are kept).
    pub fn insert(&mut self, name: &str, value: &str) {
        self.entries.push((
            name.trim().to_lowercase(),
            decode_encoded_words(value.trim()),
        ));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let name = name.to_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First value, lower-cased and trimmed; empty string if absent.
    pub fn get_lower(&self, name: &str) -> String {
        self.get(name)
            .map(|v| v.trim().to_lowercase())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Raw provenance form: a JSON array of `[name, value]` pairs.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.entries
                .iter()
                .map(|(k, v)| serde_json::json!([k, v]))
                .collect(),
        )
    }
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Join continuation lines (starting with space or tab) with the previous header.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            result.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    result
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// Example: `"=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?="` → `"Hola mundo"`
///
/// Tokens that fail to decode are kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut remaining = input;
    let mut last_was_encoded = false;

    while let Some(start) = remaining.find("=?") {
        let before = &remaining[..start];
        // Whitespace between two encoded words is dropped (RFC 2047 §6.2).
        if !last_was_encoded || !before.trim().is_empty() {
            result.push_str(before);
        }

        let after = &remaining[start + 2..];
        match decode_one_word(after) {
            Some((text, consumed)) => {
                result.push_str(&text);
                remaining = &after[consumed..];
                last_was_encoded = true;
            }
            None => {
                result.push_str("=?");
                remaining = after;
                last_was_encoded = false;
            }
        }
    }

    result.push_str(remaining);
    result
}

/// Decode `charset?encoding?text?=`; returns the text and bytes consumed.
fn decode_one_word(s: &str) -> Option<(String, usize)> {
    let (charset, rest) = s.split_once('?')?;
    let (encoding, rest) = rest.split_once('?')?;
    let end = rest.find("?=")?;
    let encoded = &rest[..end];
    let consumed = charset.len() + 1 + encoding.len() + 1 + end + 2;

    let bytes = match encoding.to_ascii_uppercase().as_str() {
        "B" => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim_end_matches('=').to_string() + padding(encoded))
            .ok()?,
        "Q" => decode_q_encoding(encoded),
        _ => return None,
    };

    Some((decode_charset(charset, &bytes), consumed))
}

/// Re-pad a base64 token that lost its trailing `=`.
fn padding(encoded: &str) -> &'static str {
    match encoded.trim_end_matches('=').len() % 4 {
        2 => "==",
        3 => "=",
        _ => "",
    }
}

/// Decode Q-encoding (RFC 2047): underscores → spaces, `=XX` → byte.
fn decode_q_encoding(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    Err(_) => out.push(b'='),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    out
}

/// Decode bytes using a named charset.
pub fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    let label = charset.trim().trim_matches('"');
    if label.is_empty() || label.eq_ignore_ascii_case("utf-8") || label.eq_ignore_ascii_case("utf8")
    {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    match encoding_rs::Encoding::for_label(label.as_bytes()) {
        Some(encoding) => encoding.decode(bytes).0.into_owned(),
        None => {
            warn!(charset = label, "Unknown charset, falling back to UTF-8 lossy");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Strip angle brackets and whitespace from a single message ID.
pub fn normalize_message_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Extract every message ID from a header value, without brackets,
/// de-duplicated in first-seen order.
///
/// Bracketed tokens are preferred; when a value has none (some clients
/// emit bare IDs) it is split on whitespace and commas instead.
pub fn extract_message_ids(value: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        let id = normalize_message_id(raw);
        if !id.is_empty() && !ids.contains(&id) {
            ids.push(id);
        }
    };

    if value.contains('<') {
        let mut remaining = value;
        while let Some(start) = remaining.find('<') {
            let Some(len) = remaining[start..].find('>') else {
                break;
            };
            push(&remaining[start..start + len + 1]);
            remaining = &remaining[start + len + 1..];
        }
    } else {
        for token in value.split(|c: char| c.is_whitespace() || c == ',') {
            if token.contains('@') {
                push(token);
            }
        }
    }

    ids
}

/// Parse an email date string in the common RFC 2822 / RFC 3339 forms and
/// their usual real-world breakages.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    // Drop a trailing "(UTC)" comment and a leading day-of-week.
    let without_comment = match trimmed.find(" (") {
        Some(pos) => &trimmed[..pos],
        None => trimmed,
    };
    let candidate = strip_day_of_week(without_comment);
    let candidate = replace_named_tz(&candidate);

    const FORMATS: [&str; 6] = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M %z",
        "%d-%b-%Y %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S %z",
        "%d %b %Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&candidate, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&candidate, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    warn!(date = trimmed, "Could not parse date");
    None
}

/// Strip leading day-of-week prefix (e.g. "Thu, " or "Thu ").
fn strip_day_of_week(s: &str) -> String {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    for day in DAYS {
        if let Some(rest) = s.strip_prefix(day) {
            return rest.trim_start_matches(',').trim().to_string();
        }
    }
    s.to_string()
}

/// Replace well-known timezone abbreviations with numeric offsets.
fn replace_named_tz(s: &str) -> String {
    const ZONES: [(&str, &str); 10] = [
        ("CEST", "+0200"),
        ("CET", "+0100"),
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
    ];
    for (name, offset) in ZONES {
        if let Some(head) = s.strip_suffix(name) {
            return format!("{head}{offset}");
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_encoded_word() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?SG9sYSBtdW5kbw==?="), "Hola mundo");
    }

    #[test]
    fn test_decode_q_encoded_word() {
        assert_eq!(decode_encoded_words("=?ISO-8859-1?Q?caf=E9?="), "café");
    }

    #[test]
    fn test_decode_adjacent_encoded_words() {
        let input = "=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?=";
        assert_eq!(decode_encoded_words(input), "Hola mundo");
    }

    #[test]
    fn test_decode_mixed_plain_and_encoded() {
        assert_eq!(
            decode_encoded_words("Re: =?UTF-8?B?SG9sYQ==?= there"),
            "Re: Hola there"
        );
    }

    #[test]
    fn test_decode_unpadded_base64() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?SG9sYQ?="), "Hola");
    }

    #[test]
    fn test_header_map_unfolds_and_is_case_insensitive() {
        let raw = b"Subject: This is a long\r\n\tsubject line\r\nList-Unsubscribe: <mailto:u@x.com>\r\n\r\nBody";
        let headers = HeaderMap::parse(raw);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("SUBJECT"), Some("This is a long subject line"));
        assert!(headers.contains("list-unsubscribe"));
    }

    #[test]
    fn test_header_map_keeps_repeated_headers() {
        let headers = HeaderMap::from_pairs([("Received", "a"), ("received", "b")]);
        assert_eq!(headers.get_all("Received").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_extract_message_ids_bracketed() {
        let ids = extract_message_ids("<a@b.com> <c@d.com>\r\n <a@b.com>");
        assert_eq!(ids, vec!["a@b.com", "c@d.com"]);
    }

    #[test]
    fn test_extract_message_ids_bare() {
        let ids = extract_message_ids("a@b.com, c@d.com");
        assert_eq!(ids, vec!["a@b.com", "c@d.com"]);
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(normalize_message_id("  <msg@ex.com>  "), "msg@ex.com");
        assert_eq!(normalize_message_id("msg@ex.com"), "msg@ex.com");
    }

    #[test]
    fn test_parse_date_rfc2822() {
        let dt = parse_date("Thu, 04 Jan 2024 10:00:00 +0000").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-01-04");
    }

    #[test]
    fn test_parse_date_named_tz_and_comment() {
        assert!(parse_date("Thu, 04 Jan 2024 10:00:00 EST").is_some());
        assert!(parse_date("Thu, 4 Jan 2024 10:00:00 +0000 (UTC)").is_some());
    }

    #[test]
    fn test_parse_date_iso8601() {
        assert!(parse_date("2024-01-04T10:00:00Z").is_some());
        assert!(parse_date("garbage").is_none());
    }
}
