//! Phone number canonicalization.
//!
//! Every phone number that is stored, compared, or looked up in the global
//! opt-out table goes through [`normalize`] first, so the same recipient is
//! always represented the same way regardless of how a caller typed the
//! number.

/// Normalize a user-supplied phone number toward E.164.
///
/// Strips everything that is not an ASCII digit; a bare 10-digit US number
/// gets the `1` country code prepended. The result is `+` followed by the
/// digits. This function is intentionally non-total: junk input yields a
/// nonsensical string rather than an error, and validating the result is the
/// caller's job (see [`looks_like_e164`]).
#[must_use]
pub fn normalize(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 10 {
        format!("+1{digits}")
    } else {
        format!("+{digits}")
    }
}

/// Whether a normalized number is plausibly E.164: a `+` followed by 8 to 15
/// digits, not starting with `0`.
#[must_use]
pub fn looks_like_e164(phone: &str) -> bool {
    let Some(digits) = phone.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len())
        && !digits.starts_with('0')
        && digits.chars().all(|c| c.is_ascii_digit())
}
