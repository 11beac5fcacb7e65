use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::config::LoadMode;

/// Public endpoints that tolerate repeated traffic.
pub const PROBE_TARGETS: &[&str] = &[
    "http://httpbin.org/bytes/1024",
    "http://httpbin.org/delay/0.1",
    "https://jsonplaceholder.typicode.com/posts",
    "http://httpbin.org/stream/10",
    "https://httpbin.org/json",
    "https://httpbin.org/uuid",
];

/// 10MB test file used to keep the link busy.
pub const SATURATION_TARGET: &str = "http://ipv4.download.thinkbroadband.com/10MB.zip";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("at least one target URL is required")]
    Empty,
    #[error("invalid target URL {input:?}: {source}")]
    Invalid {
        input: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported scheme in {0}; only http and https can be fetched")]
    Scheme(Url),
}

/// Ordered, non-empty, immutable list of endpoints. Cloning shares the list.
#[derive(Debug, Clone)]
pub struct TargetSet {
    urls: Arc<[Url]>,
}

impl TargetSet {
    pub fn new(urls: Vec<Url>) -> Result<Self, TargetError> {
        if urls.is_empty() {
            return Err(TargetError::Empty);
        }
        if let Some(bad) = urls.iter().find(|u| !matches!(u.scheme(), "http" | "https")) {
            return Err(TargetError::Scheme(bad.clone()));
        }
        Ok(TargetSet { urls: urls.into() })
    }

    pub fn parse<S: AsRef<str>>(inputs: &[S]) -> Result<Self, TargetError> {
        let urls = inputs
            .iter()
            .map(|input| {
                let input = input.as_ref();
                Url::parse(input).map_err(|source| TargetError::Invalid {
                    input: input.to_owned(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(urls)
    }

    pub fn defaults(mode: LoadMode) -> Result<Self, TargetError> {
        match mode {
            LoadMode::Probe => Self::parse(PROBE_TARGETS),
            LoadMode::Saturate => Self::parse(&[SATURATION_TARGET]),
        }
    }

    /// Uniform random choice.
    pub fn pick(&self) -> &Url {
        &self.urls[rand::random_range(0..self.urls.len())]
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.urls.iter()
    }
}
