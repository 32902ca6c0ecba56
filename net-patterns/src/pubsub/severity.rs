//! Severity-ordered topic taxonomy used to filter log traffic.
//!
//! A [`Taxonomy`] is an immutable, ordered list of topic labels; a label's
//! rank is its position. [`SeverityFilter`] accepts a topic iff its rank is
//! at least the rank of the configured minimum. Topics outside the taxonomy
//! have no rank and never pass.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use crate::error::ConfigError;

pub const DEBUG: &str = "debug";
pub const INFO: &str = "info";
pub const WARN: &str = "warn";
pub const ERROR: &str = "error";
pub const FATAL: &str = "fatal";

/// Most permissive first.
pub const STANDARD_LEVELS: [&str; 5] = [DEBUG, INFO, WARN, ERROR, FATAL];

static STANDARD: LazyLock<Arc<Taxonomy>> = LazyLock::new(|| {
    Arc::new(Taxonomy::from_unique(
        STANDARD_LEVELS.iter().map(|level| level.to_string()).collect(),
    ))
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taxonomy {
    levels: Vec<String>,
    ranks: HashMap<String, usize>,
}

impl Taxonomy {
    /// The built-in `debug < info < warn < error < fatal` table.
    pub fn standard() -> Arc<Taxonomy> {
        Arc::clone(&STANDARD)
    }

    /// Builds a taxonomy from labels ordered from most to least permissive.
    pub fn new<I, S>(levels: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let levels: Vec<String> = levels.into_iter().map(Into::into).collect();
        if levels.is_empty() {
            return Err(ConfigError::InvalidTaxonomy("no levels".to_string()));
        }
        if let Some(empty) = levels.iter().position(|level| level.is_empty()) {
            return Err(ConfigError::InvalidTaxonomy(format!(
                "level {empty} has an empty label"
            )));
        }

        let taxonomy = Self::from_unique(levels);
        if taxonomy.ranks.len() != taxonomy.levels.len() {
            return Err(ConfigError::InvalidTaxonomy(
                "duplicate level labels".to_string(),
            ));
        }
        Ok(taxonomy)
    }

    fn from_unique(levels: Vec<String>) -> Self {
        let ranks = levels
            .iter()
            .enumerate()
            .map(|(rank, level)| (level.clone(), rank))
            .collect();
        Self { levels, ranks }
    }

    pub fn rank(&self, topic: &str) -> Option<usize> {
        self.ranks.get(topic).copied()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.ranks.contains_key(topic)
    }

    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().map(String::as_str)
    }
}

/// Pass/fail gate on message topics.
#[derive(Debug, Clone)]
pub struct SeverityFilter {
    taxonomy: Arc<Taxonomy>,
    minimum: String,
    min_rank: usize,
}

impl SeverityFilter {
    pub fn new(taxonomy: Arc<Taxonomy>, minimum: &str) -> Result<Self, ConfigError> {
        let min_rank = taxonomy
            .rank(minimum)
            .ok_or_else(|| ConfigError::UnknownSeverity(minimum.to_string()))?;
        Ok(Self {
            taxonomy,
            minimum: minimum.to_string(),
            min_rank,
        })
    }

    pub fn minimum(&self) -> &str {
        &self.minimum
    }

    pub fn accepts(&self, topic: &str) -> bool {
        self.taxonomy
            .rank(topic)
            .is_some_and(|rank| rank >= self.min_rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_ranks_follow_severity_order() {
        let taxonomy = Taxonomy::standard();
        let ranks: Vec<usize> = STANDARD_LEVELS
            .iter()
            .map(|level| taxonomy.rank(level).unwrap())
            .collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
        assert_eq!(taxonomy.levels().collect::<Vec<_>>(), STANDARD_LEVELS);
    }

    #[test]
    fn filter_accepts_iff_rank_at_least_minimum() {
        let taxonomy = Taxonomy::standard();
        for (min_rank, minimum) in STANDARD_LEVELS.iter().enumerate() {
            let filter = SeverityFilter::new(Arc::clone(&taxonomy), minimum).unwrap();
            for (rank, topic) in STANDARD_LEVELS.iter().enumerate() {
                assert_eq!(
                    filter.accepts(topic),
                    rank >= min_rank,
                    "minimum {minimum}, topic {topic}"
                );
            }
        }
    }

    #[test]
    fn unknown_topics_never_pass() {
        let filter = SeverityFilter::new(Taxonomy::standard(), DEBUG).unwrap();
        assert!(!filter.accepts("trace"));
        assert!(!filter.accepts("WARN"));
        assert!(!filter.accepts(""));
    }

    #[test]
    fn unknown_minimum_is_a_config_error() {
        let err = SeverityFilter::new(Taxonomy::standard(), "verbose").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSeverity(level) if level == "verbose"));
    }

    #[test]
    fn custom_taxonomies_are_validated() {
        let custom = Taxonomy::new(["low", "high"]).unwrap();
        assert_eq!(custom.rank("high"), Some(1));
        assert!(!custom.contains(DEBUG));

        assert!(Taxonomy::new(Vec::<String>::new()).is_err());
        assert!(Taxonomy::new(["a", "b", "a"]).is_err());
        assert!(Taxonomy::new(["a", ""]).is_err());
    }
}
