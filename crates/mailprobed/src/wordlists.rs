//! Compiled-in data tables. These are deliberately short curated
//! lists; exhaustive feeds would be loaded as external data.

/// Domains whose mailboxes are throwaway by design.
pub const DISPOSABLE_DOMAINS: &[&str] = &[
    "mailinator.com",
    "guerrillamail.com",
    "guerrillamail.net",
    "10minutemail.com",
    "temp-mail.org",
    "tempmail.com",
    "throwawaymail.com",
    "yopmail.com",
    "trashmail.com",
    "getnada.com",
    "sharklasers.com",
    "maildrop.cc",
    "dispostable.com",
    "fakeinbox.com",
    "mintemail.com",
    "mohmal.com",
    "spamgourmet.com",
    "mytemp.email",
    "burnermail.io",
    "tempinbox.com",
];

/// Local parts that address a function rather than a person.
pub const ROLE_ACCOUNTS: &[&str] = &[
    "admin",
    "administrator",
    "info",
    "support",
    "sales",
    "contact",
    "help",
    "office",
    "billing",
    "accounts",
    "marketing",
    "hr",
    "jobs",
    "careers",
    "press",
    "legal",
    "noreply",
    "no-reply",
    "donotreply",
    "postmaster",
    "hostmaster",
    "webmaster",
    "abuse",
    "security",
    "hello",
    "team",
    "root",
    "mailer-daemon",
];

pub fn is_disposable_domain(domain: &str) -> bool {
    DISPOSABLE_DOMAINS.contains(&domain)
}

pub fn is_role_account(local: &str) -> bool {
    ROLE_ACCOUNTS.contains(&local)
}
