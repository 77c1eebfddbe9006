use std::collections::HashSet;

use crate::types::ProbeOutcome;

/// Decide whether an outcome passes the data-center allow-set.
///
/// No set means everything passes. With a set, an outcome without a code
/// (raw-connect mode) never passes.
pub fn accepts(outcome: &ProbeOutcome, allowed: Option<&HashSet<String>>) -> bool {
    match allowed {
        None => true,
        Some(set) => outcome
            .data_center
            .as_deref()
            .is_some_and(|code| set.contains(code)),
    }
}

/// Parse a comma separated list like `lax, sjc` into an upper-cased set.
/// Returns `None` when the list holds no codes.
pub fn parse_colo_list(s: &str) -> Option<HashSet<String>> {
    let set: HashSet<String> = s
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_ascii_uppercase)
        .collect();
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}
