//! Boot-style `key=value` command line parsing.
//!
//! Configuration arrives as one whitespace-separated line, e.g.
//! `net.ip=10.0.0.2 net.mask=255.255.255.0 klog=debug`.  Tokens without an
//! `=` are flags.  Later tokens override earlier ones.

pub fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("enabled")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value.eq_ignore_ascii_case("disabled")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

/// Decimal or `0x`-prefixed hexadecimal.
pub fn parse_u32(value: &str) -> Option<u32> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Iterate over `(key, value)` pairs.  Flags yield an empty value.
pub fn pairs(cmdline: &str) -> impl Iterator<Item = (&str, &str)> {
    cmdline
        .split_ascii_whitespace()
        .map(|token| token.split_once('=').unwrap_or((token, "")))
}

/// The last value given for `key`, if any.
pub fn value<'a>(cmdline: &'a str, key: &str) -> Option<&'a str> {
    pairs(cmdline).filter(|(k, _)| *k == key).map(|(_, v)| v).last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestResult;
    use crate::{assert_eq_test, pass};

    fn test_value_lookup() -> TestResult {
        let line = "quiet net.ip=10.0.0.2 klog=debug net.ip=10.0.0.3";
        assert_eq_test!(value(line, "net.ip"), Some("10.0.0.3"));
        assert_eq_test!(value(line, "klog"), Some("debug"));
        assert_eq_test!(value(line, "quiet"), Some(""));
        assert_eq_test!(value(line, "net.dns"), None);
        pass!()
    }

    fn test_number_parsing() -> TestResult {
        assert_eq_test!(parse_u32("8000"), Some(8000));
        assert_eq_test!(parse_u32("0x1f40"), Some(8000));
        assert_eq_test!(parse_u32("eight"), None);
        assert_eq_test!(parse_bool("On"), Some(true));
        assert_eq_test!(parse_bool("0"), Some(false));
        assert_eq_test!(parse_bool("maybe"), None);
        pass!()
    }

    crate::define_test_suite!(cmdline, [test_value_lookup, test_number_parsing]);
}
