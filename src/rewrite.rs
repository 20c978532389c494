//! Pure URL rewriting for archived media references.
//!
//! Two outputs are derived from an extracted image reference: a
//! [`NormalizedKey`] used for deduplication and filenames, and an alternate
//! raw-content archive URL used when the rendered URL no longer serves.

use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_ARCHIVE_ROOT: &str = "https://web.archive.org";
pub const MEDIA_PATH_MARKER: &str = "pbs.twimg.com/media/";
pub const CANONICAL_EXTENSION: &str = ".jpg";

const IMAGE_PROXY_MARKER: &str = "im_/";
const RAW_CONTENT_FLAG: &str = "if_";
const RAW_CONTENT_QUERY: &str = "format=jpg&name=orig";

/// `orig` is not a rendered size but the download path always discarded it too.
const SIZE_VARIANTS: &[&str] = &["large", "medium", "small", "thumb", "orig"];

/// Deduplication identity of one underlying media file, scoped to a profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedKey(String);

impl NormalizedKey {
    /// Rehydrates a key read back from the ledger.
    pub fn from_recorded(raw: &str) -> Self {
        Self(raw.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<profile>_<last path segment>`, or `None` when nothing usable remains.
    pub fn file_name(&self) -> Option<String> {
        let (profile, media) = self.0.split_once('/')?;
        let segment = media.rsplit('/').next().unwrap_or("");
        let safe = sanitize_file_segment(segment);
        let stem = safe.trim_end_matches(CANONICAL_EXTENSION);
        if profile.is_empty() || stem.trim_matches(|ch| ch == '.' || ch == '_').is_empty() {
            return None;
        }
        let mut name = format!("{profile}_{safe}");
        if !safe.contains('.') {
            name.push_str(CANONICAL_EXTENSION);
        }
        Some(name)
    }
}

impl std::fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Total: inputs that cannot be fully parsed degrade to a best-effort cleanup.
pub fn normalize(image_ref: &str, profile_id: &str) -> NormalizedKey {
    let raw = strip_control_chars(image_ref.trim());
    let cleaned = clean_media_url(&raw);
    let media = if cleaned.is_empty() { raw.as_str() } else { cleaned.as_str() };
    NormalizedKey(format!("{profile_id}/{media}"))
}

/// Tabs and line breaks inside attribute values would split a ledger line.
fn strip_control_chars(value: &str) -> String {
    value.chars().filter(|ch| !ch.is_ascii_control()).collect()
}

fn clean_media_url(raw: &str) -> String {
    let mut value = strip_query(raw);
    loop {
        let unwrapped = unwrap_archive_proxy(value);
        if unwrapped.len() == value.len() {
            break;
        }
        value = unwrapped;
    }
    let value = strip_size_variant(value);
    let value = strip_scheme(value);
    force_canonical_extension(value)
}

pub fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

pub fn strip_size_variant(url: &str) -> &str {
    for variant in SIZE_VARIANTS {
        if let Some(base) = url
            .strip_suffix(variant)
            .and_then(|rest| rest.strip_suffix(':'))
        {
            return base;
        }
    }
    url
}

/// Takes whatever follows the last `im_/` marker, as rendered `<img>` sources carry it.
pub fn unwrap_image_proxy(url: &str) -> &str {
    match url.rfind(IMAGE_PROXY_MARKER) {
        Some(idx) => &url[idx + IMAGE_PROXY_MARKER.len()..],
        None => url,
    }
}

/// Strips one `.../web/<timestamp><flag>/` wrapper, keeping the underlying URL.
fn unwrap_archive_proxy(url: &str) -> &str {
    if let Some(found) = archive_wrapper_re().find(url) {
        let rest = &url[found.end()..];
        if !rest.is_empty() {
            return rest;
        }
    }
    let unwrapped = unwrap_image_proxy(url);
    if unwrapped.is_empty() {
        url
    } else {
        unwrapped
    }
}

fn strip_scheme(url: &str) -> &str {
    match scheme_re().find(url) {
        Some(found) => &url[found.end()..],
        None => url,
    }
}

/// Replaces the last segment's extension with `.jpg`; appends it when absent.
pub fn force_canonical_extension(url: &str) -> String {
    let Some(segment_start) = last_path_segment_start(url) else {
        return url.to_string();
    };
    let (dir, segment) = url.split_at(segment_start);
    if segment.is_empty() {
        return url.to_string();
    }
    let stem = match segment.rfind('.') {
        Some(dot) if dot > 0 => &segment[..dot],
        _ => segment,
    };
    format!("{dir}{stem}{CANONICAL_EXTENSION}")
}

fn strip_extension(url: &str) -> &str {
    let Some(segment_start) = last_path_segment_start(url) else {
        return url;
    };
    match url[segment_start..].rfind('.') {
        Some(dot) if dot > 0 => &url[..segment_start + dot],
        _ => url,
    }
}

/// Byte offset of the last path segment, or `None` when the URL has no path
/// after its authority (`https://pbs.twimg.com`, `pbs.twimg.com`).
fn last_path_segment_start(url: &str) -> Option<usize> {
    let authority_start = url.find("://").map(|idx| idx + 3).unwrap_or(0);
    let path_start = authority_start + url[authority_start..].find('/')?;
    url.rfind('/').map(|idx| idx.max(path_start) + 1)
}

/// Rewrites `<root>/web/<timestamp>[flag]/<url>` into a request for the
/// archive's unmodified capture of the original-resolution file.
pub fn to_raw_content_url(archive_url: &str) -> Option<String> {
    let trimmed = archive_url.trim();
    let (root, rest) = trimmed.split_once("/web/")?;
    let (stamp_segment, underlying) = rest.split_once('/')?;
    let captures = archive_stamp_re().captures(stamp_segment)?;
    let timestamp = captures.get(1)?.as_str();

    let underlying = strip_size_variant(strip_query(underlying));
    let base = strip_extension(underlying);
    if base.trim_matches('/').is_empty() {
        return None;
    }

    let root = if root.is_empty() {
        DEFAULT_ARCHIVE_ROOT
    } else {
        root
    };
    Some(format!(
        "{root}/web/{timestamp}{RAW_CONTENT_FLAG}/{base}?{RAW_CONTENT_QUERY}"
    ))
}

/// Embeds a direct media URL in the archive's image proxy for `timestamp`.
pub fn wrap_in_archive(url: &str, archive_root: &str, timestamp: &str) -> String {
    let root = archive_root.trim_end_matches('/');
    format!("{root}/web/{timestamp}{IMAGE_PROXY_MARKER}{}", url.trim())
}

/// Makes an extracted reference absolute so it can be requested.
pub fn resolve_fetch_url(image_ref: &str, archive_root: &str) -> String {
    let trimmed = image_ref.trim();
    if trimmed.starts_with("//") {
        return format!("https:{trimmed}");
    }
    if trimmed.starts_with("/web/") {
        return format!("{}{trimmed}", archive_root.trim_end_matches('/'));
    }
    trimmed.to_string()
}

pub fn is_archive_url(url: &str) -> bool {
    archive_wrapper_re().is_match(url)
}

fn archive_wrapper_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/web/\d{1,14}(?:[a-z]{2}_)?/").expect("archive wrapper regex"))
}

fn archive_stamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,14})(?:[a-z]{2}_)?$").expect("archive stamp regex"))
}

fn scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i:[a-z][a-z0-9+.-]*:)?/*").expect("scheme regex"))
}

fn sanitize_file_segment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHOTO: &str = "https://pbs.twimg.com/media/EXAMPLEabc123.jpg";

    #[test]
    fn size_variants_and_queries_share_one_key() {
        let base = normalize(PHOTO, "NASA");
        for variant in [
            "https://pbs.twimg.com/media/EXAMPLEabc123.jpg:large",
            "https://pbs.twimg.com/media/EXAMPLEabc123.jpg:thumb",
            "https://pbs.twimg.com/media/EXAMPLEabc123.jpg?name=small",
            "https://pbs.twimg.com/media/EXAMPLEabc123?format=jpg&name=medium",
            "https://pbs.twimg.com/media/EXAMPLEabc123.png:orig",
            "http://pbs.twimg.com/media/EXAMPLEabc123.jpg",
        ] {
            assert_eq!(normalize(variant, "NASA"), base, "variant={variant}");
        }
        assert_eq!(base.as_str(), "NASA/pbs.twimg.com/media/EXAMPLEabc123.jpg");
    }

    #[test]
    fn archive_wrappers_are_unwrapped() {
        let base = normalize(PHOTO, "NASA");
        let wrapped = [
            "https://web.archive.org/web/20220301120000im_/https://pbs.twimg.com/media/EXAMPLEabc123?format=jpg&name=small",
            "/web/20150101000000/https://pbs.twimg.com/media/EXAMPLEabc123.jpg:large",
            "https://web.archive.org/web/20190101000000if_/https://pbs.twimg.com/media/EXAMPLEabc123?format=jpg&name=orig",
        ];
        for value in wrapped {
            assert_eq!(normalize(value, "NASA"), base, "value={value}");
        }
    }

    #[test]
    fn same_media_under_different_profiles_does_not_collide() {
        assert_ne!(normalize(PHOTO, "NASA"), normalize(PHOTO, "ESA"));
    }

    #[test]
    fn normalize_is_total_on_garbage() {
        let key = normalize("   ", "NASA");
        assert_eq!(key.as_str(), "NASA/");
        assert_eq!(key.file_name(), None);

        let key = normalize("not a url at all", "NASA");
        assert!(key.as_str().starts_with("NASA/"));
    }

    #[test]
    fn file_name_uses_profile_and_last_segment() {
        let key = normalize(PHOTO, "NASA");
        assert_eq!(key.file_name().as_deref(), Some("NASA_EXAMPLEabc123.jpg"));

        let dir_only = normalize("https://pbs.twimg.com/media/", "NASA");
        assert_eq!(dir_only.file_name(), None);
    }

    #[test]
    fn raw_content_url_rewrites_archive_urls() {
        let out = to_raw_content_url(
            "https://web.archive.org/web/20200102030405/https://pbs.twimg.com/media/EXAMPLEabc123.jpg",
        )
        .expect("raw url");
        assert_eq!(
            out,
            "https://web.archive.org/web/20200102030405if_/https://pbs.twimg.com/media/EXAMPLEabc123?format=jpg&name=orig"
        );
    }

    #[test]
    fn raw_content_url_replaces_existing_flag_and_keeps_timestamp() {
        let out = to_raw_content_url(
            "https://web.archive.org/web/20200102030405im_/https://pbs.twimg.com/media/EXAMPLEabc123.jpg:large?x=1",
        )
        .expect("raw url");
        assert!(out.contains("/web/20200102030405if_/"), "out={out}");
        assert!(out.ends_with("/media/EXAMPLEabc123?format=jpg&name=orig"), "out={out}");

        let again = to_raw_content_url(&out).expect("reapplied");
        assert!(again.contains("20200102030405"), "again={again}");
        assert!(again.starts_with("https://"), "again={again}");
    }

    #[test]
    fn raw_content_url_rejects_non_archive_shapes() {
        assert_eq!(to_raw_content_url(PHOTO), None);
        assert_eq!(to_raw_content_url("https://web.archive.org/web/"), None);
        assert_eq!(
            to_raw_content_url("https://web.archive.org/web/*/https://pbs.twimg.com/media/a.jpg"),
            None
        );
        assert_eq!(to_raw_content_url("https://web.archive.org/web/20200101/"), None);
    }

    #[test]
    fn raw_content_url_does_not_cut_host_dots() {
        let out = to_raw_content_url(
            "https://web.archive.org/web/20200101000000/https://pbs.twimg.com/media/NOEXT",
        )
        .expect("raw url");
        assert!(out.contains("pbs.twimg.com/media/NOEXT?format=jpg"), "out={out}");
    }

    #[test]
    fn canonical_extension_replaces_or_appends() {
        assert_eq!(
            force_canonical_extension("https://pbs.twimg.com/media/a.png"),
            "https://pbs.twimg.com/media/a.jpg"
        );
        assert_eq!(
            force_canonical_extension("https://pbs.twimg.com/media/a"),
            "https://pbs.twimg.com/media/a.jpg"
        );
    }

    #[test]
    fn embedded_control_chars_never_reach_the_key() {
        let key = normalize("https://pbs.twimg.com/media/EXAMPLE\tabc\n123.jpg\r", "NASA");
        assert_eq!(key, normalize(PHOTO, "NASA"));
        assert!(!key.as_str().chars().any(|ch| ch.is_ascii_control()));
    }

    #[test]
    fn host_without_path_keeps_its_dots() {
        assert_eq!(
            force_canonical_extension("https://pbs.twimg.com"),
            "https://pbs.twimg.com"
        );
        assert_eq!(strip_extension("https://pbs.twimg.com"), "https://pbs.twimg.com");
        assert_eq!(strip_extension("pbs.twimg.com"), "pbs.twimg.com");
        assert_eq!(
            strip_extension("https://pbs.twimg.com/media/a.jpg"),
            "https://pbs.twimg.com/media/a"
        );
        let raw = to_raw_content_url("https://web.archive.org/web/20200101000000/https://pbs.twimg.com")
            .expect("raw url");
        assert!(raw.contains("/https://pbs.twimg.com?format=jpg"), "raw={raw}");
    }

    #[test]
    fn resolve_fetch_url_handles_relative_archive_paths() {
        assert_eq!(
            resolve_fetch_url("/web/2020im_/https://pbs.twimg.com/media/a.jpg", DEFAULT_ARCHIVE_ROOT),
            "https://web.archive.org/web/2020im_/https://pbs.twimg.com/media/a.jpg"
        );
        assert_eq!(
            resolve_fetch_url("//pbs.twimg.com/media/a.jpg", DEFAULT_ARCHIVE_ROOT),
            "https://pbs.twimg.com/media/a.jpg"
        );
        assert_eq!(
            wrap_in_archive("https://pbs.twimg.com/media/a.jpg", "https://web.archive.org/", "2020"),
            "https://web.archive.org/web/2020im_/https://pbs.twimg.com/media/a.jpg"
        );
        assert!(is_archive_url("https://web.archive.org/web/2020im_/https://pbs.twimg.com/media/a.jpg"));
        assert!(!is_archive_url("https://pbs.twimg.com/media/a.jpg"));
    }
}
