/// Server-type normalisation
///
/// Hetzner renamed the shared-vCPU line; specs written against the old names
/// keep working. Unrecognised names pass through untouched so new types never
/// need a release here.
const LEGACY_TYPES: &[(&str, &str)] = &[
    ("cx22", "cx23"),
    ("cx32", "cx33"),
    ("cx42", "cx43"),
    ("cx52", "cx53"),
];

/// Map a legacy server-type name to its current equivalent,
/// case-insensitively. Anything not in the legacy table is returned as-is.
pub fn normalize(server_type: &str) -> String {
    let lowered = server_type.to_ascii_lowercase();
    LEGACY_TYPES
        .iter()
        .find(|(legacy, _)| *legacy == lowered)
        .map(|(_, current)| current.to_string())
        .unwrap_or_else(|| server_type.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_names_map_to_current() {
        assert_eq!(normalize("cx22"), "cx23");
        assert_eq!(normalize("cx32"), "cx33");
        assert_eq!(normalize("cx42"), "cx43");
        assert_eq!(normalize("cx52"), "cx53");
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(normalize("CX22"), "cx23");
        assert_eq!(normalize("Cx32"), "cx33");
    }

    #[test]
    fn test_unknown_names_pass_through() {
        assert_eq!(normalize("cx23"), "cx23");
        assert_eq!(normalize("cpx31"), "cpx31");
        assert_eq!(normalize("cax41"), "cax41");
        assert_eq!(normalize("CPX51"), "CPX51");
    }
}
