//! Glob-style key patterns
//!
//! Supports `*` (any run of characters), `?` (one character) and `\` to
//! escape either. Character classes are not supported; `[` is matched
//! literally but still ends the literal prefix so backends never push it
//! into a native glob.

/// Longest pattern prefix containing no special characters
pub fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '[' | '\\'))
        .unwrap_or(pattern.len());
    &pattern[..end]
}

/// True if `key` matches the glob `pattern`
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0usize, 0usize);
    // Position of the last `*` seen and the key index it was tried against
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    backtrack = Some((p, k));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    k += 1;
                    continue;
                }
                '\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == key[k] {
                        p += 2;
                        k += 1;
                        continue;
                    }
                }
                c if c == key[k] => {
                    p += 1;
                    k += 1;
                    continue;
                }
                _ => {}
            }
        }

        match backtrack {
            Some((star_p, star_k)) => {
                p = star_p + 1;
                k = star_k + 1;
                backtrack = Some((star_p, star_k + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
