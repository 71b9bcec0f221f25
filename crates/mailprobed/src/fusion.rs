//! Evidence fusion: fold everything the collectors learned about one
//! address into a status, a confidence score and human-readable
//! notes. This function is pure; identical evidence always produces
//! the identical verdict.

use crate::pattern::LocalAnalysis;
use provider_probes::ProviderChecks;
use serde::Serialize;
use smtp_probe::{SmtpDisposition, SmtpProbeResult};

/// The engine never claims absolute certainty.
pub const MAX_CONFIDENCE: i32 = 97;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Valid,
    Risky,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct Evidence {
    pub syntax_valid: bool,
    /// None when DNS could not answer.
    pub mx: Option<bool>,
    pub via_implicit_mx: bool,
    pub smtp: Option<SmtpProbeResult>,
    pub providers: ProviderChecks,
    pub major_provider: bool,
    pub spf: Option<bool>,
    pub dmarc: Option<bool>,
    pub website_alive: Option<bool>,
    pub is_parked: Option<bool>,
    pub domain_age_days: Option<i64>,
    pub blacklisted: Option<bool>,
    pub disposable: bool,
    pub role_account: bool,
    pub analysis: Option<LocalAnalysis>,
    pub bulk_anomaly: bool,
    pub suggested_domain: Option<String>,
    pub bounce_reporters: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: Status,
    pub confidence: u8,
    pub notes: Vec<String>,
}

fn smtp_disposition(evidence: &Evidence) -> Option<SmtpDisposition> {
    evidence.smtp.as_ref().map(|smtp| smtp.disposition)
}

fn smtp_inconclusive(evidence: &Evidence) -> bool {
    matches!(
        smtp_disposition(evidence),
        None | Some(SmtpDisposition::Error)
    )
}

/// The status ladder; the first matching rule wins.
fn determine_status(evidence: &Evidence) -> Status {
    match evidence.mx {
        None => return Status::Unknown,
        Some(false) => return Status::Invalid,
        Some(true) => {}
    }

    let smtp = smtp_disposition(evidence);

    if smtp == Some(SmtpDisposition::Rejected) && !evidence.providers.any_host_confirms() {
        return Status::Invalid;
    }
    if evidence.providers.any_host_denies() {
        return Status::Invalid;
    }

    let risk_flags = evidence.disposable || evidence.role_account;

    if evidence.providers.any_host_confirms() && !risk_flags {
        return Status::Valid;
    }
    if matches!(
        smtp,
        Some(SmtpDisposition::CatchAll) | Some(SmtpDisposition::Greylisted)
    ) {
        return Status::Risky;
    }
    if risk_flags {
        return Status::Risky;
    }
    if smtp == Some(SmtpDisposition::Accepted) {
        return Status::Valid;
    }
    if evidence.providers.any_footprint() {
        return Status::Valid;
    }
    if evidence.major_provider && smtp_inconclusive(evidence) {
        return Status::Valid;
    }

    Status::Unknown
}

pub fn fuse(evidence: &Evidence) -> Verdict {
    if !evidence.syntax_valid {
        return Verdict {
            status: Status::Invalid,
            confidence: 0,
            notes: vec!["Invalid syntax".to_string()],
        };
    }

    let status = determine_status(evidence);
    let mut notes = vec![];

    if let Some(canonical) = &evidence.suggested_domain {
        notes.push(format!("Did you mean {canonical}?"));
    }

    match evidence.mx {
        None => notes.push("DNS lookup failed; domain could not be verified".to_string()),
        Some(false) => notes.push("Domain has no MX or address records".to_string()),
        Some(true) if evidence.via_implicit_mx => {
            notes.push("No MX records; relying on the domain's own address (implicit MX)".to_string())
        }
        Some(true) => {}
    }

    // Baseline from the SMTP conversation
    let mut score: i32 = match smtp_disposition(evidence) {
        Some(SmtpDisposition::Accepted) => 85,
        Some(SmtpDisposition::Rejected) => 3,
        Some(SmtpDisposition::CatchAll) => 45,
        Some(SmtpDisposition::Greylisted) => 40,
        Some(SmtpDisposition::Error) | None => {
            if evidence.major_provider {
                65
            } else {
                35
            }
        }
    };

    match smtp_disposition(evidence) {
        Some(SmtpDisposition::Accepted) => {
            notes.push("SMTP server accepted the mailbox".to_string())
        }
        Some(SmtpDisposition::Rejected) => {
            notes.push("SMTP server rejected the mailbox".to_string())
        }
        Some(SmtpDisposition::CatchAll) => {
            if evidence.smtp.as_ref().is_some_and(|s| s.historical_catch_all) {
                notes.push(
                    "Mail server has historically accepted every recipient (suspected catch-all)"
                        .to_string(),
                );
            } else {
                notes.push("Mail server accepts any recipient (catch-all)".to_string());
            }
        }
        Some(SmtpDisposition::Greylisted) => {
            notes.push("Greylisted by the mail server; delivery unconfirmed".to_string())
        }
        Some(SmtpDisposition::Error) => {
            notes.push("SMTP verification was inconclusive".to_string())
        }
        None => {}
    }

    // Mailbox-host verdicts trump the SMTP baseline in both
    // directions: confirmed accounts get a floor, denials a ceiling.
    for (outcome, floor, exists_note, missing_note) in [
        (
            evidence.providers.microsoft,
            93,
            "Microsoft account found",
            "No Microsoft account for this address",
        ),
        (
            evidence.providers.google,
            94,
            "Google account found",
            "No Google account for this address",
        ),
        (
            evidence.providers.apple,
            93,
            "Apple account found",
            "No Apple account for this address",
        ),
    ] {
        match outcome {
            Some(true) => {
                score = score.max(floor);
                notes.push(exists_note.to_string());
            }
            Some(false) => {
                notes.push(missing_note.to_string());
            }
            None => {}
        }
    }
    if evidence.providers.any_host_denies() {
        score = score.min(5);
    }

    for (outcome, floor, note) in [
        (evidence.providers.gravatar, 80, "Gravatar profile found"),
        (
            evidence.providers.github,
            82,
            "GitHub account matches this email",
        ),
        (evidence.providers.pgp, 80, "Public PGP key found"),
        (
            evidence.providers.hibp,
            78,
            "Address appears in known data breaches",
        ),
    ] {
        if outcome == Some(true) {
            score = score.max(floor);
            notes.push(note.to_string());
        }
    }

    if evidence.via_implicit_mx && score > 50 {
        score -= 15;
    }

    match (evidence.spf, evidence.dmarc) {
        (Some(true), Some(true)) => {
            score += 3;
            notes.push("SPF and DMARC records present".to_string());
        }
        (Some(false), Some(false)) => {
            score -= 10;
            notes.push("Missing SPF and DMARC records".to_string());
        }
        _ => {}
    }

    if evidence.website_alive == Some(false) {
        score -= 10;
        notes.push("Domain website is not reachable".to_string());
    }
    if evidence.is_parked == Some(true) {
        score -= 15;
        notes.push("Domain appears to be parked".to_string());
    }
    if evidence.blacklisted == Some(true) {
        score -= 20;
        notes.push("Mail server is listed on a DNS blacklist".to_string());
    }
    if let Some(age) = evidence.domain_age_days {
        if age < 30 {
            score -= 15;
            notes.push(format!("Domain registered {age} days ago"));
        }
    }

    if let Some(analysis) = &evidence.analysis {
        if !analysis.looks_human {
            score -= 10;
            notes.push("Local part does not look like a personal or business name".to_string());
        }
        if !analysis.flags.is_empty() {
            score -= 5;
            for flag in &analysis.flags {
                notes.push(flag.note().to_string());
            }
        }
    }

    if evidence.disposable {
        score = score.min(25);
        notes.push("Disposable email domain".to_string());
    }
    if evidence.role_account {
        score -= 10;
        notes.push("Role-based address".to_string());
    }

    if evidence.bulk_anomaly {
        notes.push("Does not match the naming pattern of the rest of its batch".to_string());
    }
    if evidence.bounce_reporters >= 2 {
        notes.push(format!(
            "Reported undeliverable by {} independent sources",
            evidence.bounce_reporters
        ));
    }

    score = score.clamp(0, MAX_CONFIDENCE);
    if status == Status::Invalid {
        score = score.min(5);
    }

    Verdict {
        status,
        confidence: score as u8,
        notes,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pattern::analyze_local;
    use smtp_probe::SmtpDisposition;

    fn smtp(disposition: SmtpDisposition) -> Option<SmtpProbeResult> {
        Some(SmtpProbeResult {
            disposition,
            code: Some(250),
            host: Some("mx.example.test".to_string()),
            banner: None,
            real_latency: None,
            random_latency: None,
            historical_catch_all: false,
        })
    }

    fn baseline() -> Evidence {
        Evidence {
            syntax_valid: true,
            mx: Some(true),
            ..Evidence::default()
        }
    }

    #[test]
    fn bad_syntax_is_invalid_zero() {
        let verdict = fuse(&Evidence::default());
        assert_eq!(verdict.status, Status::Invalid);
        assert_eq!(verdict.confidence, 0);
        assert_eq!(verdict.notes, vec!["Invalid syntax".to_string()]);
    }

    #[test]
    fn mx_unknown_is_unknown() {
        let evidence = Evidence {
            syntax_valid: true,
            mx: None,
            ..Evidence::default()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Unknown);
    }

    #[test]
    fn no_mx_is_invalid_low() {
        let evidence = Evidence {
            syntax_valid: true,
            mx: Some(false),
            ..Evidence::default()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Invalid);
        assert!(verdict.confidence <= 5);
    }

    #[test]
    fn accepted_mailbox_is_valid() {
        let evidence = Evidence {
            smtp: smtp(SmtpDisposition::Accepted),
            spf: Some(true),
            dmarc: Some(true),
            analysis: Some(analyze_local("alice")),
            ..baseline()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Valid);
        assert!(verdict.confidence >= 85, "got {}", verdict.confidence);
    }

    #[test]
    fn google_probe_rescues_inconclusive_smtp() {
        let evidence = Evidence {
            smtp: smtp(SmtpDisposition::Error),
            major_provider: true,
            providers: ProviderChecks {
                google: Some(true),
                ..ProviderChecks::default()
            },
            analysis: Some(analyze_local("alice")),
            ..baseline()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Valid);
        assert!(verdict.confidence >= 94, "got {}", verdict.confidence);
    }

    #[test]
    fn host_denial_overrides_accepted_smtp() {
        let evidence = Evidence {
            smtp: smtp(SmtpDisposition::Accepted),
            providers: ProviderChecks {
                microsoft: Some(false),
                ..ProviderChecks::default()
            },
            ..baseline()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Invalid);
        assert!(verdict.confidence <= 5);
    }

    #[test]
    fn disposable_role_caps_confidence() {
        let evidence = Evidence {
            smtp: smtp(SmtpDisposition::Accepted),
            disposable: true,
            role_account: true,
            analysis: Some(analyze_local("admin")),
            ..baseline()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Risky);
        assert!(verdict.confidence <= 25, "got {}", verdict.confidence);
    }

    #[test]
    fn parked_young_domain_loses_thirty_points() {
        let quiet = Evidence {
            analysis: Some(analyze_local("user")),
            ..baseline()
        };
        let flagged = Evidence {
            is_parked: Some(true),
            domain_age_days: Some(10),
            ..quiet.clone()
        };

        let base = fuse(&quiet);
        let verdict = fuse(&flagged);
        assert!(verdict.confidence as i32 <= base.confidence as i32 - 30);
        assert!(verdict
            .notes
            .iter()
            .any(|note| note.contains("parked")));
        assert!(verdict
            .notes
            .iter()
            .any(|note| note.contains("registered 10 days ago")));
    }

    #[test]
    fn typo_suggestion_is_note_only() {
        let plain = Evidence {
            smtp: smtp(SmtpDisposition::Accepted),
            ..baseline()
        };
        let suggested = Evidence {
            suggested_domain: Some("gmail.com".to_string()),
            ..plain.clone()
        };

        let without = fuse(&plain);
        let with = fuse(&suggested);
        assert_eq!(with.status, without.status);
        assert_eq!(with.confidence, without.confidence);
        assert!(with.notes.contains(&"Did you mean gmail.com?".to_string()));
    }

    #[test]
    fn catch_all_and_greylist_are_risky() {
        for disposition in [SmtpDisposition::CatchAll, SmtpDisposition::Greylisted] {
            let evidence = Evidence {
                smtp: smtp(disposition),
                ..baseline()
            };
            let verdict = fuse(&evidence);
            assert_eq!(verdict.status, Status::Risky, "for {disposition:?}");
        }
    }

    #[test]
    fn rejected_with_no_provider_backup_is_invalid() {
        let evidence = Evidence {
            smtp: smtp(SmtpDisposition::Rejected),
            ..baseline()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Invalid);
        assert!(verdict.confidence <= 5);
    }

    #[test]
    fn rejected_but_provider_confirms_is_not_invalid() {
        let evidence = Evidence {
            smtp: smtp(SmtpDisposition::Rejected),
            providers: ProviderChecks {
                microsoft: Some(true),
                ..ProviderChecks::default()
            },
            ..baseline()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Valid);
        assert!(verdict.confidence >= 93);
    }

    #[test]
    fn footprint_alone_makes_valid() {
        let evidence = Evidence {
            providers: ProviderChecks {
                github: Some(true),
                ..ProviderChecks::default()
            },
            ..baseline()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Valid);
        assert!(verdict.confidence >= 82);
    }

    #[test]
    fn major_provider_inconclusive_is_valid() {
        let evidence = Evidence {
            smtp: smtp(SmtpDisposition::Error),
            major_provider: true,
            ..baseline()
        };
        let verdict = fuse(&evidence);
        assert_eq!(verdict.status, Status::Valid);
    }

    #[test]
    fn implicit_mx_shaves_high_scores_only() {
        let high = Evidence {
            smtp: smtp(SmtpDisposition::Accepted),
            via_implicit_mx: true,
            ..baseline()
        };
        assert_eq!(fuse(&high).confidence, 70);

        let low = Evidence {
            smtp: smtp(SmtpDisposition::Greylisted),
            via_implicit_mx: true,
            ..baseline()
        };
        assert_eq!(fuse(&low).confidence, 40);
    }

    #[test]
    fn fusion_is_pure() {
        let evidence = Evidence {
            smtp: smtp(SmtpDisposition::CatchAll),
            providers: ProviderChecks {
                gravatar: Some(true),
                ..ProviderChecks::default()
            },
            spf: Some(true),
            dmarc: Some(true),
            analysis: Some(analyze_local("jane.doe")),
            ..baseline()
        };
        let first = fuse(&evidence);
        let second = fuse(&evidence);
        assert_eq!(first, second);
    }

    #[test]
    fn confidence_always_in_bounds() {
        let dispositions = [
            None,
            Some(SmtpDisposition::Accepted),
            Some(SmtpDisposition::Rejected),
            Some(SmtpDisposition::CatchAll),
            Some(SmtpDisposition::Greylisted),
            Some(SmtpDisposition::Error),
        ];
        let tristate = [None, Some(false), Some(true)];

        for disposition in dispositions {
            for mx in [None, Some(false), Some(true)] {
                for microsoft in tristate {
                    for gravatar in tristate {
                        for disposable in [false, true] {
                            for parked in tristate {
                                let evidence = Evidence {
                                    syntax_valid: true,
                                    mx,
                                    via_implicit_mx: mx == Some(true) && disposable,
                                    smtp: disposition.map(|d| smtp(d).unwrap()),
                                    providers: ProviderChecks {
                                        microsoft,
                                        gravatar,
                                        ..ProviderChecks::default()
                                    },
                                    spf: Some(false),
                                    dmarc: Some(false),
                                    website_alive: Some(false),
                                    is_parked: parked,
                                    domain_age_days: Some(5),
                                    blacklisted: Some(true),
                                    disposable,
                                    role_account: disposable,
                                    analysis: Some(analyze_local("zq1")),
                                    ..Evidence::default()
                                };
                                let verdict = fuse(&evidence);
                                assert!(verdict.confidence <= 97);
                                if verdict.status == Status::Invalid {
                                    assert!(
                                        verdict.confidence <= 5,
                                        "invalid verdict with confidence {}",
                                        verdict.confidence
                                    );
                                }
                                if mx == Some(false) {
                                    assert_eq!(verdict.status, Status::Invalid);
                                }
                                // A host denial is only reachable once
                                // MX resolution succeeded
                                if microsoft == Some(false) && mx == Some(true) {
                                    assert_eq!(verdict.status, Status::Invalid);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
