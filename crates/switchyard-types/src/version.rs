//! Domain version parsing.
//!
//! Domain versions are written loosely (`"1"`, `"1.0"`, `"1.0.3"`). They are
//! padded to three components and compared as semantic versions.

use semver::Version;

/// Parse a domain version, padding missing minor/patch components with zero.
///
/// Returns `None` for anything that is not a valid version after padding.
pub fn parse_domain_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if trimmed.is_empty() {
        return None;
    }
    let core_len = trimmed
        .find(['-', '+'])
        .unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(core_len);
    let parts = core.split('.').count();
    let padded = match parts {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded).ok()
}

/// True when both strings name the same version once padded.
pub fn versions_equal(a: &str, b: &str) -> bool {
    match (parse_domain_version(a), parse_domain_version(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}
