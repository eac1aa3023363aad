//! Cluster naming: `<base>-<template>-<suffix>` when a base name is
//! supplied, else `<template>-<suffix>`. Collisions are resolved by
//! regenerating the suffix, bounded to 5 attempts by the caller.

#[derive(Debug, thiserror::Error)]
#[error("could not find a non-colliding name after {attempts} attempts")]
pub struct NameError {
    pub attempts: u32,
}

pub const MAX_NAMING_ATTEMPTS: u32 = 5;

/// Derives a short, human-legible suffix from an opaque id (its trailing
/// characters), matching the way the id's own randomness is reused rather
/// than minting a second independent source of entropy.
pub fn suffix_from_id(id: &str) -> String {
    let lower = id.to_ascii_lowercase();
    let len = lower.len();
    lower[len.saturating_sub(6)..].to_string()
}

pub fn generate_name(base_name: Option<&str>, template_name: &str, suffix: &str) -> String {
    match base_name {
        Some(base) => format!("{base}-{template_name}-{suffix}"),
        None => format!("{template_name}-{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_with_base_includes_base_and_template() {
        let name = generate_name(Some("prod"), "postgres", "ab12cd");
        assert_eq!(name, "prod-postgres-ab12cd");
    }

    #[test]
    fn name_without_base_omits_it() {
        let name = generate_name(None, "postgres", "ab12cd");
        assert_eq!(name, "postgres-ab12cd");
    }

    #[test]
    fn suffix_takes_trailing_characters() {
        assert_eq!(suffix_from_id("01HX8Z9QABCDEF"), "abcdef");
    }
}
