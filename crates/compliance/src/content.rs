//! Advisory content scanner.
//!
//! Flags copy that regulators in most markets disallow: health claims and
//! terms appealing to minors. Detection is case-insensitive substring
//! matching — intentionally blunt, since the result is advisory only. The
//! pipeline logs issues; it never blocks a send on them.

use serde::{Deserialize, Serialize};

/// Terms that read as medical or therapeutic claims.
const HEALTH_CLAIM_TERMS: &[&str] = &[
    "cure",
    "treats",
    "treatment",
    "heals",
    "therapeutic",
    "medical benefit",
    "doctor recommended",
    "fda approved",
    "prescription",
    "remedy",
    "pain relief",
    "anxiety relief",
    "anti-inflammatory",
];

/// Terms that read as appealing to minors.
const MINOR_APPEALING_TERMS: &[&str] = &[
    "candy",
    "gummy bear",
    "cartoon",
    "lollipop",
    "juice box",
    "for kids",
    "teen",
    "child",
];

/// Which list a flagged term came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueList {
    HealthClaim,
    MinorAppealing,
}

/// A single flagged term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentIssue {
    /// The list the term belongs to.
    pub list: IssueList,
    /// The matched term.
    pub term: String,
}

/// Result of scanning a message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentScan {
    /// `true` when no term matched.
    pub approved: bool,
    /// Every matched term, in list order.
    pub issues: Vec<ContentIssue>,
}

/// Scan message copy for flagged terms. `state` is accepted for future
/// per-state lists; every state currently shares the same two lists.
#[must_use]
pub fn scan_content(text: &str, state: Option<&str>) -> ContentScan {
    let _ = state;
    let haystack = text.to_lowercase();
    let mut issues = Vec::new();

    for term in HEALTH_CLAIM_TERMS {
        if haystack.contains(term) {
            issues.push(ContentIssue {
                list: IssueList::HealthClaim,
                term: (*term).to_owned(),
            });
        }
    }
    for term in MINOR_APPEALING_TERMS {
        if haystack.contains(term) {
            issues.push(ContentIssue {
                list: IssueList::MinorAppealing,
                term: (*term).to_owned(),
            });
        }
    }

    ContentScan {
        approved: issues.is_empty(),
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_copy_is_approved() {
        let scan = scan_content("20% off all flower this weekend. Reply STOP to opt out.", None);
        assert!(scan.approved);
        assert!(scan.issues.is_empty());
    }

    #[test]
    fn health_claims_are_flagged() {
        let scan = scan_content("Our tincture CURES insomnia and offers pain relief!", Some("CA"));
        assert!(!scan.approved);
        assert!(scan.issues.iter().any(|i| i.term == "cure"));
        assert!(scan.issues.iter().any(|i| i.term == "pain relief"));
        assert!(scan.issues.iter().all(|i| i.list == IssueList::HealthClaim));
    }

    #[test]
    fn minor_appealing_terms_are_flagged() {
        let scan = scan_content("New candy flavored gummies!", None);
        assert!(!scan.approved);
        assert!(
            scan.issues
                .iter()
                .any(|i| i.list == IssueList::MinorAppealing && i.term == "candy")
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let scan = scan_content("DOCTOR RECOMMENDED", None);
        assert!(!scan.approved);
    }

    #[test]
    fn issue_list_serializes_kebab_case() {
        let json = serde_json::to_string(&IssueList::HealthClaim).unwrap();
        assert_eq!(json, "\"health-claim\"");
        let json = serde_json::to_string(&IssueList::MinorAppealing).unwrap();
        assert_eq!(json, "\"minor-appealing\"");
    }
}
