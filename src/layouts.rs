//! Page-encoding strategies that pull a profile's photo references out of one
//! archived page body.
//!
//! Each strategy answers with a three-valued [`ExtractionOutcome`]. It reports
//! [`ExtractionOutcome::NotApplicable`] when nothing on the page belongs to the
//! profile under its encoding. It reports [`ExtractionOutcome::Found`] (possibly
//! with no images) once profile content is located. It reports
//! [`ExtractionOutcome::Malformed`] when the body cannot be read at all.

use crate::rewrite::{
    force_canonical_extension, strip_query, strip_size_variant, unwrap_image_proxy,
    MEDIA_PATH_MARKER,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

/// An image URL as it appears in the page, before normalization.
pub type ImageRef = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    NotApplicable,
    Found(BTreeSet<ImageRef>),
    Malformed(String),
}

pub trait LayoutExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Must not perform I/O.
    fn extract(&self, body: &[u8], profile_id: &str) -> ExtractionOutcome;
}

/// Rendered markup from the React-era site (`<article data-testid="tweet">`).
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentEraMarkup;

/// Rendered markup from the pre-2022 site (`<div class="tweet" data-screen-name>`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyMarkup;

/// Raw API captures (`{"data": ..., "includes": {...}}`).
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredData;

impl LayoutExtractor for CurrentEraMarkup {
    fn name(&self) -> &'static str {
        "current_markup"
    }

    fn extract(&self, body: &[u8], profile_id: &str) -> ExtractionOutcome {
        let html = String::from_utf8_lossy(body);
        let document = Html::parse_document(&html);

        let selector_article =
            Selector::parse(r#"article[data-testid="tweet"]"#).expect("article selector");
        let selector_anchor = Selector::parse("a[href]").expect("anchor selector");
        let selector_thumb = Selector::parse(r#"meta[itemprop="thumbnailUrl"][content]"#)
            .expect("thumbnail selector");
        let selector_photo =
            Selector::parse(r#"div[data-testid="tweetPhoto"]"#).expect("photo selector");
        let selector_img = Selector::parse("img[src]").expect("img selector");

        let status_marker = format!("/{}/status/", profile_id.to_ascii_lowercase());
        let mut attributed = false;
        let mut images = BTreeSet::new();

        for article in document.select(&selector_article) {
            if !links_to_status(&article, &selector_anchor, &status_marker) {
                continue;
            }
            attributed = true;

            let thumbnails: Vec<&str> = article
                .select(&selector_thumb)
                .filter_map(|meta| meta.value().attr("content"))
                .collect();
            if !thumbnails.is_empty() {
                for url in thumbnails {
                    if url.contains(MEDIA_PATH_MARKER) {
                        images.insert(canonical_media_url(url));
                    }
                }
                continue;
            }

            for photo in article.select(&selector_photo) {
                let Some(src) = photo
                    .select(&selector_img)
                    .next()
                    .and_then(|img| img.value().attr("src"))
                else {
                    continue;
                };
                if !src.contains(MEDIA_PATH_MARKER) {
                    continue;
                }
                images.insert(canonical_media_url(unwrap_image_proxy(src)));
            }
        }

        if attributed {
            ExtractionOutcome::Found(images)
        } else {
            ExtractionOutcome::NotApplicable
        }
    }
}

impl LayoutExtractor for LegacyMarkup {
    fn name(&self) -> &'static str {
        "legacy_markup"
    }

    fn extract(&self, body: &[u8], profile_id: &str) -> ExtractionOutcome {
        let html = String::from_utf8_lossy(body);
        let document = Html::parse_document(&html);

        let selector_container =
            Selector::parse("div[data-screen-name]").expect("tweet container selector");
        let selector_image_url =
            Selector::parse("div[data-image-url]").expect("image url selector");
        let selector_preview = Selector::parse(r#"meta[property="og:image"][content]"#)
            .expect("preview meta selector");

        let mut found = false;
        let mut images = BTreeSet::new();

        for container in document.select(&selector_container) {
            let screen_name = container.value().attr("data-screen-name").unwrap_or("");
            if !screen_name.trim().eq_ignore_ascii_case(profile_id) {
                continue;
            }
            if !container
                .value()
                .classes()
                .any(|class| tweet_class_re().is_match(class))
            {
                continue;
            }
            found = true;

            let mut from_attribute = false;
            for media in container.select(&selector_image_url) {
                let url = media.value().attr("data-image-url").unwrap_or("").trim();
                if url.is_empty() {
                    continue;
                }
                images.insert(strip_size_variant(url).to_string());
                from_attribute = true;
            }
            if from_attribute {
                continue;
            }

            for meta in container.select(&selector_preview) {
                let url = meta.value().attr("content").unwrap_or("").trim();
                if url.contains(MEDIA_PATH_MARKER) {
                    images.insert(strip_size_variant(url).to_string());
                }
            }
        }

        if found {
            ExtractionOutcome::Found(images)
        } else {
            ExtractionOutcome::NotApplicable
        }
    }
}

impl LayoutExtractor for StructuredData {
    fn name(&self) -> &'static str {
        "structured_data"
    }

    fn extract(&self, body: &[u8], profile_id: &str) -> ExtractionOutcome {
        let value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(err) => return ExtractionOutcome::Malformed(format!("not valid json: {err}")),
        };
        if !value.is_object() {
            return ExtractionOutcome::NotApplicable;
        }
        let capture: ApiCapture = match serde_json::from_value(value) {
            Ok(v) => v,
            Err(err) => {
                return ExtractionOutcome::Malformed(format!("unexpected api capture shape: {err}"))
            }
        };

        let includes = capture.includes.unwrap_or_default();
        let mut media_urls: HashMap<String, String> = HashMap::new();
        for media in &includes.media {
            if media.kind.as_deref() != Some("photo") {
                continue;
            }
            if let (Some(key), Some(url)) = (&media.media_key, &media.url) {
                media_urls.insert(key.as_key(), url.clone());
            }
        }

        let target_user_id = includes.users.iter().find_map(|user| {
            let username = user.username.as_deref()?;
            if username.eq_ignore_ascii_case(profile_id) {
                user.id.as_ref().map(ApiId::as_key)
            } else {
                None
            }
        });
        let Some(target_user_id) = target_user_id else {
            return ExtractionOutcome::NotApplicable;
        };

        let primary: Vec<ApiTweet> = match capture.data {
            Some(OneOrMany::Many(items)) => items,
            Some(OneOrMany::One(item)) => vec![item],
            None => Vec::new(),
        };

        let mut images = BTreeSet::new();
        for tweet in primary.iter().chain(includes.tweets.iter()) {
            let authored = tweet
                .author_id
                .as_ref()
                .map(|id| id.as_key() == target_user_id)
                .unwrap_or(false);
            if !authored {
                continue;
            }
            let Some(attachments) = &tweet.attachments else {
                continue;
            };
            for key in &attachments.media_keys {
                if let Some(url) = media_urls.get(&key.as_key()) {
                    images.insert(url.clone());
                }
            }
        }

        ExtractionOutcome::Found(images)
    }
}

/// The status permalink is the only reliable owner marker in rendered cards.
fn links_to_status(article: &ElementRef<'_>, selector_anchor: &Selector, marker: &str) -> bool {
    article.select(selector_anchor).any(|anchor| {
        anchor
            .value()
            .attr("href")
            .map(|href| href.to_ascii_lowercase().contains(marker))
            .unwrap_or(false)
    })
}

fn canonical_media_url(url: &str) -> String {
    force_canonical_extension(strip_size_variant(strip_query(url.trim())))
}

fn tweet_class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\btweet\b").expect("tweet class regex"))
}

#[derive(Debug, Default, Deserialize)]
struct ApiCapture {
    #[serde(default)]
    data: Option<OneOrMany<ApiTweet>>,
    #[serde(default)]
    includes: Option<ApiIncludes>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiIncludes {
    media: Vec<ApiMedia>,
    users: Vec<ApiUser>,
    tweets: Vec<ApiTweet>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiMedia {
    media_key: Option<ApiId>,
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiUser {
    id: Option<ApiId>,
    username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiTweet {
    author_id: Option<ApiId>,
    attachments: Option<ApiAttachments>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiAttachments {
    media_keys: Vec<ApiId>,
}

/// Ids show up both as strings and as bare numbers depending on the capture.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ApiId {
    Text(String),
    Number(u64),
}

impl ApiId {
    fn as_key(&self) -> String {
        match self {
            Self::Text(v) => v.trim().to_string(),
            Self::Number(v) => v.to_string(),
        }
    }
}
