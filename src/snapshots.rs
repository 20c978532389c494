use crate::fetch::{Fetch, FetchKind};
use crate::{HarvestError, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use url::Url;

pub const DEFAULT_CDX_ENDPOINT: &str = "https://web.archive.org/cdx/search/cdx";
pub const DEFAULT_SITE_ROOT: &str = "twitter.com";

/// Rows requested per CDX page.
pub const INDEX_PAGE_LIMIT: usize = 5_000;
const MAX_INDEX_PAGES: usize = 1_000;

/// One archived capture. Ordering is by timestamp, then URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Snapshot {
    pub timestamp: String,
    pub original_url: String,
}

impl Snapshot {
    pub fn new(timestamp: impl Into<String>, original_url: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            original_url: original_url.into(),
        }
    }

    pub fn page_url(&self, archive_root: &str) -> String {
        format!(
            "{}/web/{}/{}",
            archive_root.trim_end_matches('/'),
            self.timestamp,
            self.original_url
        )
    }
}

/// Inclusive archive-timestamp bounds (`YYYY[MM[DD[hh[mm[ss]]]]]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub from: Option<String>,
    pub to: Option<String>,
}

/// One CDX response: the rows kept for the profile plus the key of the next page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPage {
    pub snapshots: BTreeSet<Snapshot>,
    pub resume_key: Option<String>,
}

pub fn build_index_query_url(
    cdx_endpoint: &str,
    site_root: &str,
    profile_id: &str,
    range: &TimeRange,
    resume_key: Option<&str>,
) -> Result<String> {
    let target = format!("{}/{profile_id}", site_root.trim_end_matches('/'));
    let limit = INDEX_PAGE_LIMIT.to_string();
    let mut params: Vec<(&str, &str)> = vec![
        ("url", target.as_str()),
        ("matchType", "prefix"),
        ("output", "json"),
        ("fl", "timestamp,original"),
        ("showResumeKey", "true"),
        ("limit", limit.as_str()),
    ];
    if let Some(from) = range.from.as_deref() {
        params.push(("from", from));
    }
    if let Some(to) = range.to.as_deref() {
        params.push(("to", to));
    }
    if let Some(key) = resume_key {
        params.push(("resumeKey", key));
    }
    let url = Url::parse_with_params(cdx_endpoint, &params).map_err(|err| {
        HarvestError::InvalidRequest(format!("invalid cdx endpoint {cdx_endpoint}: {err}"))
    })?;
    Ok(url.to_string())
}

/// Parses the CDX `output=json` table. The first row is a header; an empty body
/// means no captures. With `showResumeKey`, an empty row followed by a
/// single-column row carries the key of the next page.
pub fn parse_index_rows(body: &[u8], profile_id: &str) -> Result<IndexPage> {
    let mut out = IndexPage::default();
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(out);
    }
    let rows: Vec<Vec<String>> = serde_json::from_slice(body)?;
    let mut after_separator = false;
    for (idx, row) in rows.into_iter().enumerate() {
        if row.is_empty() {
            after_separator = true;
            continue;
        }
        if after_separator && row.len() == 1 {
            let key = row[0].trim();
            if !key.is_empty() {
                out.resume_key = Some(key.to_string());
            }
            continue;
        }
        if row.len() < 2 {
            continue;
        }
        if idx == 0 && row[0] == "timestamp" {
            continue;
        }
        let mut cols = row.into_iter();
        let (Some(timestamp), Some(original)) = (cols.next(), cols.next()) else {
            continue;
        };
        if !belongs_to_profile(&original, profile_id) {
            continue;
        }
        out.snapshots.insert(Snapshot::new(timestamp, original));
    }
    Ok(out)
}

/// A prefix query for `/NASA` also returns `/NASAJPL`; keep only whole-segment matches.
fn belongs_to_profile(original_url: &str, profile_id: &str) -> bool {
    let lowered = original_url.to_ascii_lowercase();
    let marker = format!("/{}", profile_id.to_ascii_lowercase());
    lowered.match_indices(&marker).any(|(idx, _)| {
        let rest = &lowered[idx + marker.len()..];
        rest.is_empty() || rest.starts_with(['/', '?', '#'])
    })
}

/// Lists the deduplicated captures of a profile, following resume keys until
/// the index has no more pages. Any failure is an index-query error.
pub fn query_snapshots(
    fetcher: &dyn Fetch,
    cdx_endpoint: &str,
    site_root: &str,
    profile_id: &str,
    range: &TimeRange,
) -> Result<BTreeSet<Snapshot>> {
    let mut out = BTreeSet::new();
    let mut resume_key: Option<String> = None;
    for _ in 0..MAX_INDEX_PAGES {
        let query = build_index_query_url(
            cdx_endpoint,
            site_root,
            profile_id,
            range,
            resume_key.as_deref(),
        )?;
        let body = fetcher
            .fetch(&query, FetchKind::Page)
            .map_err(|err| HarvestError::IndexQuery {
                query: query.clone(),
                detail: err.to_string(),
            })?;
        let page = parse_index_rows(&body, profile_id).map_err(|err| HarvestError::IndexQuery {
            query: query.clone(),
            detail: err.to_string(),
        })?;
        out.extend(page.snapshots);
        match page.resume_key {
            Some(next) if resume_key.as_deref() != Some(next.as_str()) => resume_key = Some(next),
            Some(_) => {
                return Err(HarvestError::IndexQuery {
                    query,
                    detail: "index returned the same resume key twice".to_string(),
                })
            }
            None => return Ok(out),
        }
    }
    Err(HarvestError::IndexQuery {
        query: cdx_endpoint.to_string(),
        detail: format!("more than {MAX_INDEX_PAGES} index pages"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn query_url_carries_range_and_prefix_match() {
        let url = build_index_query_url(
            DEFAULT_CDX_ENDPOINT,
            DEFAULT_SITE_ROOT,
            "NASA",
            &TimeRange {
                from: Some("2015".to_string()),
                to: Some("20201231".to_string()),
            },
            None,
        )
        .expect("url");
        assert!(url.starts_with("https://web.archive.org/cdx/search/cdx?"), "url={url}");
        assert!(url.contains("url=twitter.com%2FNASA"), "url={url}");
        assert!(url.contains("matchType=prefix"), "url={url}");
        assert!(url.contains("from=2015"), "url={url}");
        assert!(url.contains("to=20201231"), "url={url}");
        assert!(url.contains("showResumeKey=true"), "url={url}");
        assert!(url.contains(&format!("limit={INDEX_PAGE_LIMIT}")), "url={url}");
        assert!(!url.contains("resumeKey="), "url={url}");
    }

    #[test]
    fn rows_are_deduplicated_sorted_and_scoped() {
        let body = br#"[
          ["timestamp","original"],
          ["20200101000000","https://twitter.com/NASA/status/2"],
          ["20190101000000","https://twitter.com/NASA"],
          ["20200101000000","https://twitter.com/NASA/status/2"],
          ["20190601000000","https://twitter.com/NASAJPL"],
          ["20190701000000","https://twitter.com/nasa/media?lang=en"],
          ["broken"]
        ]"#;
        let snapshots: Vec<Snapshot> = parse_index_rows(body, "NASA")
            .expect("rows")
            .snapshots
            .into_iter()
            .collect();
        assert_eq!(
            snapshots,
            vec![
                Snapshot::new("20190101000000", "https://twitter.com/NASA"),
                Snapshot::new("20190701000000", "https://twitter.com/nasa/media?lang=en"),
                Snapshot::new("20200101000000", "https://twitter.com/NASA/status/2"),
            ]
        );
    }

    #[test]
    fn empty_body_means_no_captures() {
        assert_eq!(parse_index_rows(b"", "NASA").expect("empty"), IndexPage::default());
        assert_eq!(
            parse_index_rows(b"[]", "NASA").expect("empty array"),
            IndexPage::default()
        );
    }

    #[test]
    fn resume_key_trailer_is_split_from_rows() {
        let body = br#"[
          ["timestamp","original"],
          ["20200101000000","https://twitter.com/NASA"],
          [],
          ["com,twitter)/nasa 20200101000000"]
        ]"#;
        let page = parse_index_rows(body, "NASA").expect("page");
        assert_eq!(page.snapshots.len(), 1);
        assert_eq!(
            page.resume_key.as_deref(),
            Some("com,twitter)/nasa 20200101000000")
        );
    }

    /// Serves page two only when the request carries the first page's resume key.
    struct PagedIndex {
        requests: Mutex<Vec<String>>,
    }

    impl Fetch for PagedIndex {
        fn fetch(&self, url: &str, _kind: FetchKind) -> Result<Vec<u8>> {
            self.requests.lock().expect("requests").push(url.to_string());
            let body = if url.contains("resumeKey=page2") {
                r#"[["timestamp","original"],["20210101000000","https://twitter.com/NASA/status/9"]]"#
            } else {
                r#"[["timestamp","original"],["20200101000000","https://twitter.com/NASA"],[],["page2"]]"#
            };
            Ok(body.as_bytes().to_vec())
        }
    }

    #[test]
    fn query_follows_resume_keys_across_pages() {
        let fetcher = PagedIndex {
            requests: Mutex::new(Vec::new()),
        };
        let snapshots = query_snapshots(
            &fetcher,
            DEFAULT_CDX_ENDPOINT,
            DEFAULT_SITE_ROOT,
            "NASA",
            &TimeRange::default(),
        )
        .expect("snapshots");
        let timestamps: Vec<&str> = snapshots.iter().map(|s| s.timestamp.as_str()).collect();
        assert_eq!(timestamps, vec!["20200101000000", "20210101000000"]);

        let requests = fetcher.requests.lock().expect("requests");
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].contains("resumeKey=page2"), "first={}", requests[0]);
        assert!(requests[1].contains("resumeKey=page2"), "second={}", requests[1]);
    }

    struct StuckIndex;

    impl Fetch for StuckIndex {
        fn fetch(&self, _url: &str, _kind: FetchKind) -> Result<Vec<u8>> {
            Ok(br#"[["20200101000000","https://twitter.com/NASA"],[],["same"]]"#.to_vec())
        }
    }

    #[test]
    fn repeated_resume_key_is_an_index_error() {
        let err = query_snapshots(
            &StuckIndex,
            DEFAULT_CDX_ENDPOINT,
            DEFAULT_SITE_ROOT,
            "NASA",
            &TimeRange::default(),
        )
        .expect_err("stuck pagination");
        assert!(matches!(err, HarvestError::IndexQuery { .. }), "err={err:?}");
    }

    #[test]
    fn page_url_joins_archive_root() {
        let snap = Snapshot::new("20200101000000", "https://twitter.com/NASA");
        assert_eq!(
            snap.page_url("https://web.archive.org/"),
            "https://web.archive.org/web/20200101000000/https://twitter.com/NASA"
        );
    }
}
