/// Common misspellings of the big consumer mail domains. A hit only
/// produces a suggestion; it never changes the verdict for the
/// domain that was actually submitted.
const TYPO_DOMAINS: &[(&str, &str)] = &[
    ("gmial.com", "gmail.com"),
    ("gmal.com", "gmail.com"),
    ("gamil.com", "gmail.com"),
    ("gnail.com", "gmail.com"),
    ("gmai.com", "gmail.com"),
    ("gmaill.com", "gmail.com"),
    ("gmail.co", "gmail.com"),
    ("gmail.cm", "gmail.com"),
    ("googlemail.co", "googlemail.com"),
    ("yaho.com", "yahoo.com"),
    ("yahooo.com", "yahoo.com"),
    ("yhoo.com", "yahoo.com"),
    ("yahoo.co", "yahoo.com"),
    ("yaoo.com", "yahoo.com"),
    ("outlok.com", "outlook.com"),
    ("outllook.com", "outlook.com"),
    ("outloo.com", "outlook.com"),
    ("outlook.co", "outlook.com"),
    ("hotmial.com", "hotmail.com"),
    ("hotmal.com", "hotmail.com"),
    ("hotmil.com", "hotmail.com"),
    ("homail.com", "hotmail.com"),
    ("hotmai.com", "hotmail.com"),
    ("hotmail.co", "hotmail.com"),
    ("icloud.co", "icloud.com"),
    ("iclod.com", "icloud.com"),
    ("icoud.com", "icloud.com"),
    ("iclould.com", "icloud.com"),
    ("aol.co", "aol.com"),
    ("aoll.com", "aol.com"),
    ("protonmai.com", "protonmail.com"),
    ("protonmial.com", "protonmail.com"),
    ("proton.m", "proton.me"),
    ("live.co", "live.com"),
    ("livee.com", "live.com"),
];

/// The canonical domain this one is probably a misspelling of.
pub fn suggest_domain(domain: &str) -> Option<&'static str> {
    TYPO_DOMAINS
        .iter()
        .find(|(typo, _)| *typo == domain)
        .map(|(_, canonical)| *canonical)
}
