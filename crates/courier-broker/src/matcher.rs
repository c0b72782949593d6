// Destination matching: exact names or a single `*` glob.

/// True when `candidate` matches `pattern`.
///
/// A pattern without `*` matches only itself. With a single `*` the
/// pattern's literal characters must appear in order at the ends of the
/// candidate, so `/eos/*/fst` matches `/eos/host1/fst` but not
/// `/eos/host1/mgm`. The literal parts may not overlap: the candidate has
/// to be at least as long as prefix plus suffix.
pub fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == candidate,
        Some((prefix, suffix)) => {
            candidate.len() >= prefix.len() + suffix.len()
                && candidate.starts_with(prefix)
                && candidate.ends_with(suffix)
        }
    }
}

pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*')
}
