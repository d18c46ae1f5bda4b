use std::cmp::Ordering;

fn components(v: &str) -> Vec<&str> {
    v.trim_start_matches('v')
        .split(['.', '-', '_'])
        .filter(|s| !s.is_empty())
        .collect()
}

/// Compare version strings component-wise, numerically where both sides
/// are numbers.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts = components(a);
    let b_parts = components(b);

    for (x, y) in a_parts.iter().zip(b_parts.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    a_parts.len().cmp(&b_parts.len())
}

/// `version` equals `wanted` or extends it with further dotted components
/// (`1.8` matches `1.8.17` but not `1.80`).
pub fn version_matches(version: &str, wanted: &str) -> bool {
    version == wanted
        || version
            .strip_prefix(wanted)
            .is_some_and(|rest| rest.starts_with('.'))
}
