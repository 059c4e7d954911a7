use std::fmt;

/// Number of leading token characters that may appear in logs.
const VISIBLE_PREFIX: usize = 8;

/// Display wrapper that never prints a full API token.
///
/// Tokens longer than eight characters show their first eight followed by
/// `...`; shorter tokens are fully masked.
#[derive(Clone, Copy)]
pub struct RedactedToken<'a>(pub &'a str);

impl fmt::Debug for RedactedToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RedactedToken({})", self)
    }
}

impl fmt::Display for RedactedToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.chars().count() > VISIBLE_PREFIX {
            let prefix: String = self.0.chars().take(VISIBLE_PREFIX).collect();
            write!(f, "{}...", prefix)
        } else {
            f.write_str("...")
        }
    }
}

/// Shorthand for `RedactedToken(token)`.
pub fn redact(token: &str) -> RedactedToken<'_> {
    RedactedToken(token)
}
