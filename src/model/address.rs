//! Email address parsing and canonicalization (RFC 5322 §3.4).

use serde::{Deserialize, Serialize};

/// Maximum length of a full address path.
const MAX_ADDRESS_LEN: usize = 254;

/// An address as delivered by a protocol envelope or a header.
///
/// # Examples
/// - `"Juan García <juan@ejemplo.com>"` → `display_name = "Juan García"`, `address = "juan@ejemplo.com"`
/// - `"user@example.com"` → `display_name = ""`, `address = "user@example.com"`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailAddress {
    /// Human-readable display name (may be empty).
    pub display_name: String,
    /// The address as written (`user@domain`), not yet validated.
    pub address: String,
}

impl EmailAddress {
    /// Build from a bare address with no display name.
    pub fn bare(address: impl Into<String>) -> Self {
        Self {
            display_name: String::new(),
            address: address.into(),
        }
    }

    /// Parse a single email address from a header value.
    ///
    /// Supported formats:
    /// - `"user@domain.com"`
    /// - `"<user@domain.com>"`
    /// - `"Display Name <user@domain.com>"`
    /// - `"\"Display, Name\" <user@domain.com>"`
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();

        if let (Some(open), Some(close)) = (trimmed.rfind('<'), trimmed.rfind('>')) {
            if close > open {
                return Self {
                    display_name: strip_quotes(&trimmed[..open]),
                    address: trimmed[open + 1..close].trim().to_string(),
                };
            }
        }

        Self::bare(trimmed)
    }

    /// Parse a comma-separated list of addresses.
    ///
    /// Handles quoted commas: `"Last, First" <a@b.com>, other@c.com`
    pub fn parse_list(raw: &str) -> Vec<Self> {
        let mut results = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_angle = false;

        for ch in raw.chars() {
            match ch {
                '"' => in_quotes = !in_quotes,
                '<' if !in_quotes => in_angle = true,
                '>' if !in_quotes => in_angle = false,
                ',' | ';' if !in_quotes && !in_angle => {
                    results.push(Self::parse(&current));
                    current.clear();
                    continue;
                }
                _ => {}
            }
            current.push(ch);
        }
        results.push(Self::parse(&current));

        results.retain(|a| !a.address.is_empty());
        results
    }

    /// Validate and canonicalize the address part.
    ///
    /// Returns the lower-cased bare address, or `None` if it is not a
    /// syntactically plausible `local@domain`.
    pub fn canonical(&self) -> Option<String> {
        canonicalize(&self.address)
    }

    /// Format for display: `"Display Name <address>"` or just `"address"`.
    pub fn display(&self) -> String {
        if self.display_name.is_empty() {
            self.address.clone()
        } else {
            format!("{} <{}>", self.display_name, self.address)
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Validate a bare address and return its lower-cased form.
///
/// Accepts optional surrounding angle brackets and a `mailto:` prefix.
/// Syntax is checked by [`lettre::Address`], the parser the SMTP envelope
/// uses. Single-label domains such as `localhost` are rejected.
pub fn canonicalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    let trimmed = trimmed.strip_prefix("mailto:").unwrap_or(trimmed);
    let lower = trimmed.to_lowercase();

    if lower.is_empty() || lower.len() > MAX_ADDRESS_LEN {
        return None;
    }

    let parsed: lettre::Address = match lower.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::trace!(address = %lower, error = %e, "Address rejected");
            return None;
        }
    };
    if !parsed.domain().contains('.') {
        return None;
    }

    Some(lower)
}

/// Canonicalize a list, dropping invalid entries and duplicates while
/// keeping first-seen order.
pub fn canonical_list<'a>(addresses: impl IntoIterator<Item = &'a EmailAddress>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for addr in addresses {
        match addr.canonical() {
            Some(canon) if !out.contains(&canon) => out.push(canon),
            Some(_) => {}
            None => tracing::debug!(address = %addr.address, "Dropping invalid address"),
        }
    }
    out
}

/// Domain part of a canonical address (`""` if there is none).
pub fn domain_of(address: &str) -> &str {
    address.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
}

/// Local part of a canonical address (the whole string if there is no `@`).
pub fn local_part(address: &str) -> &str {
    address.rsplit_once('@').map(|(l, _)| l).unwrap_or(address)
}

/// Strip surrounding double-quotes and trim whitespace.
fn strip_quotes(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].trim().to_string()
    } else {
        trimmed.to_string()
    }
}
