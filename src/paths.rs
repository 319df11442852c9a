//! Path normalization for cross-platform equality checks.
//!
//! Message records reference files in several spellings: raw absolute paths,
//! `file://` URLs, the app's `local-file://` scheme, Windows paths with
//! backslashes, percent-encoded names. Everything is folded into one
//! canonical lowercase, forward-slash form before comparison.

use tracing::warn;

const SCHEMES: &[&str] = &["local-file://", "file://"];

/// Canonicalize a path or file URL for comparison.
///
/// Strips the scheme, converts backslashes, drops the slash in front of a
/// drive letter (`/C:/x` -> `c:/x`), percent-decodes, lowercases, collapses
/// repeated slashes and removes a trailing slash (root excepted). The steps
/// repeat until the output is stable, so `normalize(normalize(p)) == normalize(p)`.
/// A pass that changes an already-normalized string has decoded at least one
/// escape, so the loop ends.
pub fn normalize(path: &str) -> String {
    let mut current = normalize_once(path);
    loop {
        let next = normalize_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn normalize_once(path: &str) -> String {
    drop_trailing_slash(readable_once(path).to_lowercase())
}

/// Like `normalize` but keeps the original case and any trailing slash, so
/// the result can be written back as a real path.
pub fn readable(path: &str) -> String {
    let mut current = readable_once(path);
    loop {
        let next = readable_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn readable_once(path: &str) -> String {
    let forward = strip_scheme(path).replace('\\', "/");
    let decoded = percent_decode(strip_drive_slash(&forward));
    collapse_slashes(&decoded)
}

/// The `file://` or `local-file://` prefix of `path`, or `""`
pub fn scheme_of(path: &str) -> &str {
    &path[..path.len() - strip_scheme(path).len()]
}

/// Remainder of `path` below directory `dir`, compared in normalized form.
///
/// `Some("")` when `path` is `dir` itself, `None` when it lies elsewhere. The
/// remainder keeps its original case and is percent-decoded.
pub fn relative_to(path: &str, dir: &str) -> Option<String> {
    let dir = normalize(dir);
    let dir_segments: Vec<&str> = dir.trim_end_matches('/').split('/').collect();
    let readable = readable(path);
    let segments: Vec<&str> = readable.trim_end_matches('/').split('/').collect();
    if segments.len() < dir_segments.len() {
        return None;
    }
    let inside = dir_segments
        .iter()
        .zip(&segments)
        .all(|(d, s)| s.to_lowercase() == *d);
    inside.then(|| segments[dir_segments.len()..].join("/"))
}

/// Percent-encode each segment of a forward-slash path for use in a URL.
/// Drive colons stay readable.
pub fn encode_url_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .map(|segment| urlencoding::encode(segment).replace("%3A", ":"))
        .collect::<Vec<_>>()
        .join("/")
}

fn strip_scheme(path: &str) -> &str {
    for scheme in SCHEMES {
        match path.get(..scheme.len()) {
            Some(head) if head.eq_ignore_ascii_case(scheme) => return &path[scheme.len()..],
            _ => {}
        }
    }
    path
}

/// `/C:/Users` -> `C:/Users`
fn strip_drive_slash(path: &str) -> &str {
    let bytes = path.as_bytes();
    if bytes.len() >= 4
        && bytes[0] == b'/'
        && bytes[1].is_ascii_alphabetic()
        && bytes[2] == b':'
        && bytes[3] == b'/'
    {
        &path[1..]
    } else {
        path
    }
}

fn percent_decode(path: &str) -> String {
    if !path.contains('%') {
        return path.to_string();
    }
    match urlencoding::decode(path) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            warn!("Failed to percent-decode path {}: {}", path, e);
            path.to_string()
        }
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

fn drop_trailing_slash(mut path: String) -> String {
    if path.len() > 1 && path.ends_with('/') && !is_drive_root(&path) {
        path.pop();
    }
    path
}

fn is_drive_root(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() == 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

/// Last segment of a normalized path.
pub fn basename(normalized: &str) -> &str {
    normalized.rsplit('/').next().unwrap_or(normalized)
}

/// True if any directory segment of the normalized path is `images`.
pub fn is_in_images_dir(normalized: &str) -> bool {
    let mut segments: Vec<&str> = normalized.split('/').collect();
    segments.pop();
    segments.iter().any(|s| *s == "images")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_schemes() {
        assert_eq!(normalize("file:///home/u/a.png"), "/home/u/a.png");
        assert_eq!(normalize("local-file:///home/u/a.png"), "/home/u/a.png");
        assert_eq!(normalize("LOCAL-FILE:///home/u/A.png"), "/home/u/a.png");
    }

    #[test]
    fn test_windows_paths() {
        assert_eq!(normalize(r"C:\Users\Me\Chat\photo.PNG"), "c:/users/me/chat/photo.png");
        assert_eq!(normalize("file:///C:/Users/Me/x.png"), "c:/users/me/x.png");
        assert_eq!(normalize("local-file://C:\\Users\\Me\\x.png"), "c:/users/me/x.png");
    }

    #[test]
    fn test_percent_decoding_and_slashes() {
        assert_eq!(normalize("/home/u/my%20chat//a.png"), "/home/u/my chat/a.png");
        assert_eq!(normalize("/home/u/chat/"), "/home/u/chat");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("C:/"), "c:/");
    }

    #[test]
    fn test_malformed_escape_is_not_fatal() {
        // %FF decodes to invalid UTF-8; the pre-decode value is kept
        assert_eq!(normalize("/Home/%FF.png"), "/home/%ff.png");
        assert_eq!(normalize("/home/100%.png"), "/home/100%.png");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "file:///C:/Users/A%20B//x.png/",
            "/home/u/%2541.txt",
            "local-file://%2FC%3A%2Fdir%5Cfile.png",
            r"\\server\share\\File.JPG",
            "",
            "/",
            "relative/Path/",
            "/home/%FF/x",
        ];
        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn test_deeply_encoded_path_is_idempotent() {
        let nested = format!("/home/{}41", "%25".repeat(9));
        let once = normalize(&nested);
        assert_eq!(once, "/home/a");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to("local-file:///s/My%20Chat/Photos/A.png", "/s/my chat").as_deref(),
            Some("Photos/A.png")
        );
        assert_eq!(relative_to(r"C:\Chats\Trip\a.png", "c:/chats/trip").as_deref(), Some("a.png"));
        assert_eq!(relative_to("/s/my chat/", "/s/my chat").as_deref(), Some(""));
        assert_eq!(relative_to("/s/my chats/a.png", "/s/my chat"), None);
        assert_eq!(relative_to("/s", "/s/my chat"), None);
    }

    #[test]
    fn test_scheme_and_url_encoding() {
        assert_eq!(scheme_of("local-file:///s/a.png"), "local-file://");
        assert_eq!(scheme_of("FILE:///s/a.png"), "FILE://");
        assert_eq!(scheme_of("/s/a.png"), "");
        assert_eq!(encode_url_path("/s/my trip/a b.png"), "/s/my%20trip/a%20b.png");
        assert_eq!(encode_url_path(r"C:\Chats\x.png"), "C:/Chats/x.png");
    }

    #[test]
    fn test_basename_and_images_dir() {
        assert_eq!(basename("/a/b/img_1.png"), "img_1.png");
        assert_eq!(basename("img_1.png"), "img_1.png");
        assert!(is_in_images_dir("/chat/images/img_1.png"));
        assert!(!is_in_images_dir("/chat/img_1.png"));
        assert!(!is_in_images_dir("/chat/images"));
    }
}
