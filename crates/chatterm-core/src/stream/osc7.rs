//! OSC-7 working directory URI normalization
//!
//! Shells report their cwd as `ESC ] 7 ; file://<host>/<path> BEL`. The path
//! is percent-encoded; Windows shells send drive paths as `/C:/Users/...`.

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;

/// `/C:` or `/C:/rest` after percent-decoding
static DRIVE_PATH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/([A-Za-z]):(?:/(.*))?$").unwrap());

const FILE_SCHEME: &str = "file://";

/// Turn an OSC-7 URI into a local path.
///
/// Returns `None` for anything that is not a `file://` URI with an absolute
/// path, or whose decoded path is not valid UTF-8.
pub fn normalize_osc7_uri(uri: &str) -> Option<String> {
    let uri = uri.trim();
    let scheme = uri.get(..FILE_SCHEME.len())?;
    if !scheme.eq_ignore_ascii_case(FILE_SCHEME) {
        return None;
    }
    let rest = &uri[FILE_SCHEME.len()..];

    // Query and fragment carry nothing useful for a directory report
    let rest = rest
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or_default();

    let slash = rest.find('/')?;
    let (host, encoded_path) = rest.split_at(slash);
    if host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }

    let path = percent_decode_str(encoded_path).decode_utf8().ok()?;
    if path.chars().any(|c| c.is_control()) {
        return None;
    }

    if let Some(caps) = DRIVE_PATH_PATTERN.captures(&path) {
        let drive = &caps[1];
        let tail = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        return Some(format!("{}:\\{}", drive, tail.replace('/', "\\")));
    }

    Some(path.into_owned())
}
