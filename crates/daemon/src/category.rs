//! Category module for deciding how a completed directory is filed.
//!
//! A request's category comes from where it was dropped in the intake tree
//! (`tv/...`, `movies/...`). The decision sits behind [`Categorizer`] so the
//! finalizer can be driven by other rules in tests or future deployments.

use std::path::Path;

/// The closed set of categories the finalizer knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Episodic content; completed directories are kept whole.
    Tv,
    /// A single feature; the largest file of a completed directory is kept.
    Movies,
    /// No rule matched.
    Unknown,
}

impl Default for Category {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Tv => write!(f, "tv"),
            Category::Movies => write!(f, "movies"),
            Category::Unknown => write!(f, "unknown"),
        }
    }
}

/// Strategy that assigns a category to a request.
pub trait Categorizer: Send + Sync {
    /// `request_path` is the request's location relative to the intake root.
    fn categorize(&self, request_path: &Path) -> Category;
}

/// Case-insensitive substring rules over the request path.
///
/// TV keywords are checked before movie keywords.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordCategorizer {
    tv_keywords: Vec<String>,
    movie_keywords: Vec<String>,
}

impl KeywordCategorizer {
    pub fn new<S: AsRef<str>>(tv_keywords: &[S], movie_keywords: &[S]) -> Self {
        let lower = |keywords: &[S]| -> Vec<String> {
            keywords
                .iter()
                .map(|kw| kw.as_ref().to_lowercase())
                .filter(|kw| !kw.is_empty())
                .collect()
        };
        Self {
            tv_keywords: lower(tv_keywords),
            movie_keywords: lower(movie_keywords),
        }
    }
}

impl Default for KeywordCategorizer {
    fn default() -> Self {
        Self::new(&["tv"], &["movies"])
    }
}

/// Checks if the path string contains any of the given keywords.
fn contains_any_keyword(path_str: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|kw| path_str.contains(kw.as_str()))
}

impl Categorizer for KeywordCategorizer {
    fn categorize(&self, request_path: &Path) -> Category {
        let path_str = request_path.to_string_lossy().to_lowercase();

        if contains_any_keyword(&path_str, &self.tv_keywords) {
            return Category::Tv;
        }

        if contains_any_keyword(&path_str, &self.movie_keywords) {
            return Category::Movies;
        }

        Category::Unknown
    }
}
