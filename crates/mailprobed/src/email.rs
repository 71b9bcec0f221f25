use serde::Serialize;

const MAX_TOTAL_LEN: usize = 254;
const MAX_LOCAL_LEN: usize = 64;
const MAX_LABEL_LEN: usize = 63;

/// A normalized, syntactically valid address: lower-cased, trimmed,
/// `mailto:` stripped, split at the last `@`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailAddress {
    pub address: String,
    pub local: String,
    pub domain: String,
}

pub fn normalize(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    match lowered.strip_prefix("mailto:") {
        Some(stripped) => stripped.to_string(),
        None => lowered,
    }
}

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

fn valid_local(local: &str) -> bool {
    if local.is_empty() || local.len() > MAX_LOCAL_LEN {
        return false;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }
    local.chars().all(|c| c == '.' || is_atext(c))
}

fn valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

pub fn valid_domain(domain: &str) -> bool {
    // A deliverable public address needs at least one dot
    domain.contains('.') && domain.split('.').all(valid_label)
}

/// Parse one raw input into its normalized form, or None when the
/// syntax is hopeless.
pub fn parse(raw: &str) -> Option<EmailAddress> {
    let address = normalize(raw);
    if address.len() > MAX_TOTAL_LEN {
        return None;
    }

    let (local, domain) = address.rsplit_once('@')?;
    if !valid_local(local) || !valid_domain(domain) {
        return None;
    }

    Some(EmailAddress {
        local: local.to_string(),
        domain: domain.to_string(),
        address,
    })
}
