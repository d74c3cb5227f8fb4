//! Query/body string serialization for outbound requests.

/// Serialize an ordered sequence of key/value pairs into `key=value&...`.
///
/// Values are joined verbatim, without percent-encoding, and the output
/// preserves the input order, so the result is deterministic for a given
/// sequence.
pub fn serialize<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}
