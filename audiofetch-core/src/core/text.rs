use encoding_rs::GBK;

/// Whether fetcher output on this platform may arrive in the legacy ANSI code page.
pub const LEGACY_CODEPAGE_OUTPUT: bool = cfg!(windows);

/// Turns one raw output line into valid UTF-8.
///
/// Valid UTF-8 passes through. Otherwise, when `try_legacy` is set, the bytes are decoded as
/// GBK; if that also fails the invalid sequences are dropped. Trailing `\r` is removed.
pub fn sanitize_line(raw: &[u8], try_legacy: bool) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }

    if try_legacy {
        if let Some(decoded) = GBK.decode_without_bom_handling_and_without_replacement(raw) {
            return decoded.into_owned();
        }
    }

    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect()
}

/// Last component of a path as printed by the fetcher, which may use either separator.
pub fn base_name(path: &str) -> &str {
    let path = path.trim().trim_matches('"');
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
