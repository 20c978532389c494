use crate::layouts::{
    CurrentEraMarkup, ExtractionOutcome, ImageRef, LayoutExtractor, LegacyMarkup, StructuredData,
};
use std::collections::BTreeSet;

/// Page-level answer handed back to the harvest loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageExtraction {
    /// A strategy located profile content. `images` may be empty.
    Images {
        strategy: &'static str,
        images: BTreeSet<ImageRef>,
    },
    /// No strategy recognized profile content on the page.
    NoProfileContent,
    /// A strategy could not parse the page at all.
    Malformed {
        strategy: &'static str,
        detail: String,
    },
}

impl PageExtraction {
    pub fn images(&self) -> Option<&BTreeSet<ImageRef>> {
        match self {
            Self::Images { images, .. } => Some(images),
            Self::NoProfileContent | Self::Malformed { .. } => None,
        }
    }

    pub fn image_count(&self) -> usize {
        self.images().map(BTreeSet::len).unwrap_or(0)
    }
}

/// Ordered strategies; the first one that does not answer `NotApplicable` wins.
pub struct ExtractorChain {
    extractors: Vec<Box<dyn LayoutExtractor>>,
}

impl Default for ExtractorChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(CurrentEraMarkup),
            Box::new(LegacyMarkup),
            Box::new(StructuredData),
        ])
    }
}

impl ExtractorChain {
    pub fn new(extractors: Vec<Box<dyn LayoutExtractor>>) -> Self {
        Self { extractors }
    }

    pub fn push(&mut self, extractor: Box<dyn LayoutExtractor>) {
        self.extractors.push(extractor);
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    pub fn dispatch(&self, body: &[u8], profile_id: &str) -> PageExtraction {
        for extractor in &self.extractors {
            match extractor.extract(body, profile_id) {
                ExtractionOutcome::NotApplicable => continue,
                ExtractionOutcome::Found(images) => {
                    return PageExtraction::Images {
                        strategy: extractor.name(),
                        images,
                    }
                }
                ExtractionOutcome::Malformed(detail) => {
                    return PageExtraction::Malformed {
                        strategy: extractor.name(),
                        detail,
                    }
                }
            }
        }
        PageExtraction::NoProfileContent
    }
}
