use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use tracing::warn;

use crate::error::{ConsumerError, Result};

#[derive(Debug, Clone)]
pub enum TopicSelector {
    Exact(String),
    Pattern(Regex),
}

impl TopicSelector {
    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(TopicSelector::Pattern)
            .map_err(|e| ConsumerError::Config(format!("invalid topic pattern {pattern:?}: {e}")))
    }

    /// Parse a configured topic entry; `/regex/` entries become patterns
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ConsumerError::Config("empty topic name".to_string()));
        }
        match entry
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(pattern) if !pattern.is_empty() => Self::pattern(pattern),
            _ => Ok(TopicSelector::Exact(entry.to_string())),
        }
    }
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicSelector::Exact(name) => write!(f, "{name}"),
            TopicSelector::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

impl From<&str> for TopicSelector {
    fn from(name: &str) -> Self {
        TopicSelector::Exact(name.to_string())
    }
}

impl From<String> for TopicSelector {
    fn from(name: String) -> Self {
        TopicSelector::Exact(name)
    }
}

impl From<Regex> for TopicSelector {
    fn from(regex: Regex) -> Self {
        TopicSelector::Pattern(regex)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Subscription {
    topics: Vec<TopicSelector>,
    from_beginning: bool,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: impl Into<TopicSelector>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TopicSelector>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = from_beginning;
        self
    }

    pub fn selectors(&self) -> &[TopicSelector] {
        &self.topics
    }

    pub fn is_from_beginning(&self) -> bool {
        self.from_beginning
    }

    /// Turn selectors into concrete topic names against the cluster's
    /// current topic list. Topics created later are not picked up.
    pub fn resolve(&self, available: &[String]) -> Result<ResolvedSubscription> {
        if self.topics.is_empty() {
            return Err(ConsumerError::Config(
                "subscription needs at least one topic".to_string(),
            ));
        }

        let mut topics = BTreeSet::new();
        for selector in &self.topics {
            match selector {
                TopicSelector::Exact(name) => {
                    topics.insert(name.clone());
                }
                TopicSelector::Pattern(regex) => {
                    let before = topics.len();
                    topics.extend(available.iter().filter(|t| regex.is_match(t)).cloned());
                    if topics.len() == before {
                        warn!(pattern = regex.as_str(), "Topic pattern matched no topics");
                    }
                }
            }
        }

        Ok(ResolvedSubscription {
            topics: topics.into_iter().collect(),
            from_beginning: self.from_beginning,
        })
    }
}

/// Subscription with patterns expanded to topic names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSubscription {
    topics: Vec<String>,
    from_beginning: bool,
}

impl ResolvedSubscription {
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn from_beginning(&self) -> bool {
        self.from_beginning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_topics() -> Vec<String> {
        ["events", "logs-web", "logs-api", "metrics"]
            .iter()
            .map(|t| t.to_string())
            .collect()
    }

    #[test]
    fn test_exact_and_pattern_topics_resolve() {
        let subscription = Subscription::new()
            .topic("events")
            .topic(TopicSelector::pattern("^logs-.*").unwrap())
            .from_beginning(true);

        let resolved = subscription.resolve(&cluster_topics()).unwrap();

        assert_eq!(resolved.topics(), &["events", "logs-api", "logs-web"]);
        assert!(resolved.from_beginning());
    }

    #[test]
    fn test_exact_topic_is_kept_even_if_unknown() {
        let resolved = Subscription::new()
            .topic("not-created-yet")
            .resolve(&cluster_topics())
            .unwrap();

        assert_eq!(resolved.topics(), &["not-created-yet"]);
    }

    #[test]
    fn test_duplicates_collapse() {
        let resolved = Subscription::new()
            .topics(["events", "events"])
            .topic(TopicSelector::pattern("^ev").unwrap())
            .resolve(&cluster_topics())
            .unwrap();

        assert_eq!(resolved.topics(), &["events"]);
    }

    #[test]
    fn test_pattern_resolved_only_against_given_metadata() {
        let subscription = Subscription::new().topic(TopicSelector::pattern("^logs-").unwrap());

        let resolved = subscription.resolve(&cluster_topics()).unwrap();
        assert_eq!(resolved.topics().len(), 2);

        // a topic created afterwards only shows up on a new resolution
        let mut later = cluster_topics();
        later.push("logs-worker".to_string());
        assert_eq!(resolved.topics().len(), 2);
        assert_eq!(subscription.resolve(&later).unwrap().topics().len(), 3);
    }

    #[test]
    fn test_empty_subscription_rejected() {
        assert!(matches!(
            Subscription::new().resolve(&cluster_topics()),
            Err(ConsumerError::Config(_))
        ));
    }

    #[test]
    fn test_parse_entries() {
        assert!(matches!(TopicSelector::parse("events"), Ok(TopicSelector::Exact(t)) if t == "events"));
        assert!(matches!(TopicSelector::parse("/^logs-.*/"), Ok(TopicSelector::Pattern(_))));
        assert!(TopicSelector::parse("/[/").is_err());
        assert!(TopicSelector::parse("  ").is_err());
        assert_eq!(TopicSelector::parse("/^a$/").unwrap().to_string(), "/^a$/");
    }
}
