//! Reply/forward marker removal for subjects.
//!
//! Mail clients prefix subjects with localized markers (`Re:`, `AW:`,
//! `SV:`, `Fwd:` ...) and sometimes counters (`Re[2]:`). Threading needs the
//! subject without any of them.

/// Markers recognized in every locale.
pub const DEFAULT_PREFIXES: [&str; 8] = ["re", "fwd", "fw", "aw", "ant", "sv", "vs", "r"];

/// Remove leading reply/forward markers until none remain.
///
/// `extra_prefixes` are additional locale tokens from configuration
/// (compared case-insensitively). The returned subject keeps its original
/// case.
pub fn clean_subject(subject: &str, extra_prefixes: &[String]) -> String {
    let mut current = subject.trim();
    loop {
        match strip_one_marker(current, extra_prefixes) {
            Some(rest) => current = rest.trim_start(),
            None => break,
        }
    }
    current.trim().to_string()
}

/// Subject form used to match threads: cleaned, lower-cased, whitespace
/// collapsed.
pub fn normalize_subject(subject: &str, extra_prefixes: &[String]) -> String {
    clean_subject(subject, extra_prefixes)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Strip a single `<marker>[counter]:` from the start of `s`.
fn strip_one_marker<'a>(s: &'a str, extra_prefixes: &[String]) -> Option<&'a str> {
    // The marker is the run of letters before the colon.
    let letters_end = s
        .char_indices()
        .find(|(_, c)| !c.is_alphabetic())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if letters_end == 0 {
        return None;
    }

    let token = s[..letters_end].to_lowercase();
    let known = DEFAULT_PREFIXES.contains(&token.as_str())
        || extra_prefixes
            .iter()
            .any(|p| p.trim().trim_end_matches(':').to_lowercase() == token);
    if !known {
        return None;
    }

    let mut rest = &s[letters_end..];

    // Optional counter: "Re[2]:" or "Re(2):"
    if let Some(inner) = rest.strip_prefix('[').or_else(|| rest.strip_prefix('(')) {
        let close = inner.find([']', ')'])?;
        if !inner[..close].chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        rest = &inner[close + 1..];
    }

    // "RE :" is common from some clients; the full-width colon from CJK ones.
    let rest = rest.trim_start_matches(' ');
    rest.strip_prefix(':').or_else(|| rest.strip_prefix('：'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(s: &str) -> String {
        clean_subject(s, &[])
    }

    #[test]
    fn test_clean_subject_basic_markers() {
        assert_eq!(clean("Hello"), "Hello");
        assert_eq!(clean("Re: Hello"), "Hello");
        assert_eq!(clean("Fwd: Hello"), "Hello");
        assert_eq!(clean("FW: Re: Hello"), "Hello");
    }

    #[test]
    fn test_clean_subject_repeats_until_clean() {
        assert_eq!(clean("Re: Re: Fwd: Quarterly numbers"), "Quarterly numbers");
        assert_eq!(clean("RE: AW: SV: VS: Planning"), "Planning");
    }

    #[test]
    fn test_clean_subject_localized_and_counters() {
        assert_eq!(clean("AW: Termin"), "Termin");
        assert_eq!(clean("ANT: Reunião"), "Reunião");
        assert_eq!(clean("R: Riunione"), "Riunione");
        assert_eq!(clean("Re[3]: Status"), "Status");
        assert_eq!(clean("RE : Status"), "Status");
        assert_eq!(clean("Re：会議"), "会議");
    }

    #[test]
    fn test_clean_subject_leaves_words_that_are_not_markers() {
        assert_eq!(clean("Review: the plan"), "Review: the plan");
        assert_eq!(clean("Reply needed"), "Reply needed");
        assert_eq!(clean("Re"), "Re");
    }

    #[test]
    fn test_clean_subject_with_configured_tokens() {
        let extra = vec!["Odp".to_string(), "TR:".to_string()];
        assert_eq!(clean_subject("Odp: TR: Faktura", &extra), "Faktura");
        assert_eq!(clean("Odp: Faktura"), "Odp: Faktura");
    }

    #[test]
    fn test_normalize_subject() {
        assert_eq!(normalize_subject("Re:  Hello   World ", &[]), "hello world");
    }
}
