//! Upstream Identities
//!
//! The two catalog services the access layer talks to, and the cache
//! namespaces each of them owns.

use serde::{Deserialize, Serialize};

/// Upstream catalog service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Upstream {
    /// Self-hosted Audiobookshelf library server
    Abs,
    /// Audible marketplace API
    Audible,
}

impl Upstream {
    /// All known upstreams
    pub const ALL: [Upstream; 2] = [Upstream::Abs, Upstream::Audible];

    /// Short lowercase name, used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Upstream::Abs => "abs",
            Upstream::Audible => "audible",
        }
    }

    /// Cache namespaces owned by this upstream
    pub fn namespaces(&self) -> &'static [&'static str] {
        match self {
            Upstream::Abs => &[
                "abs_libraries",
                "abs_items",
                "abs_stats",
                "abs_authors",
                "abs_series",
            ],
            Upstream::Audible => &[
                "library",
                "catalog",
                "search",
                "audible_enrichment",
                "audible_wishlist",
                "audible_stats",
            ],
        }
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Upstream {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abs" | "audiobookshelf" => Ok(Upstream::Abs),
            "audible" => Ok(Upstream::Audible),
            other => Err(crate::error::Error::Configuration(format!(
                "unknown upstream: {}",
                other
            ))),
        }
    }
}

/// Origin of a cached value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Abs,
    Audible,
    Other,
}

impl Source {
    /// Infer the source from a namespace name.
    ///
    /// `abs_*` belongs to ABS; `audible*` and the marketplace resource
    /// namespaces belong to Audible; everything else is `Other`.
    pub fn from_namespace(namespace: &str) -> Self {
        if namespace.starts_with("abs_") {
            Source::Abs
        } else if namespace.starts_with("audible")
            || matches!(namespace, "library" | "catalog" | "search")
        {
            Source::Audible
        } else {
            Source::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Abs => "abs",
            Source::Audible => "audible",
            Source::Other => "other",
        }
    }

    /// Parse the persisted column value; unknown strings map to `Other`
    pub fn parse(s: &str) -> Self {
        match s {
            "abs" => Source::Abs,
            "audible" => Source::Audible,
            _ => Source::Other,
        }
    }
}

impl From<Upstream> for Source {
    fn from(upstream: Upstream) -> Self {
        match upstream {
            Upstream::Abs => Source::Abs,
            Upstream::Audible => Source::Audible,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
