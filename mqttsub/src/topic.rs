//! Topic filters, topic names and MQTT wildcard matching.
//!
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last)
//! - topics starting with `$` are not matched by a wildcard in the first level

use crate::error::{Error, Result, ValidationError};
use std::fmt;
use std::sync::Arc;

/// Maximum length in bytes of a topic name or filter.
pub const MAX_TOPIC_LEN: usize = 65535;

/// One level of a topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Level {
    /// Exact level content.
    Literal(String),
    /// `+`
    SingleWildcard,
    /// `#`
    MultiWildcard,
}

impl Level {
    fn is_wildcard(&self) -> bool {
        !matches!(self, Level::Literal(_))
    }
}

/// Parsed subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: Arc<str>,
    levels: Vec<Level>,
}

impl TopicFilter {
    /// Parse a filter string.
    pub fn parse(filter: &str) -> std::result::Result<Self, ValidationError> {
        if filter.is_empty() {
            return Err(ValidationError::EmptyFilter);
        }
        if filter.len() > MAX_TOPIC_LEN {
            return Err(ValidationError::FilterTooLong { len: filter.len() });
        }

        let parts: Vec<&str> = filter.split('/').collect();
        let last = parts.len() - 1;
        let mut levels = Vec::with_capacity(parts.len());

        for (i, part) in parts.into_iter().enumerate() {
            let level = match part {
                "#" if i != last => {
                    return Err(ValidationError::MultiWildcardNotLast(filter.to_string()));
                }
                "#" => Level::MultiWildcard,
                "+" => Level::SingleWildcard,
                s if s.contains('#') => {
                    return Err(ValidationError::MultiWildcardNotAlone(filter.to_string()));
                }
                s if s.contains('+') => {
                    return Err(ValidationError::SingleWildcardNotAlone(filter.to_string()));
                }
                s => Level::Literal(s.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            raw: Arc::from(filter),
            levels,
        })
    }

    /// The filter as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed levels.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Whether the filter contains `+` or `#`.
    pub fn has_wildcards(&self) -> bool {
        self.levels.iter().any(Level::is_wildcard)
    }

    /// Check whether `topic` matches this filter.
    pub fn matches(&self, topic: &TopicName) -> bool {
        let reserved = topic.is_reserved();
        let mut names = topic.levels();

        for (i, level) in self.levels.iter().enumerate() {
            if i == 0 && reserved && level.is_wildcard() {
                return false;
            }
            match level {
                Level::MultiWildcard => return true,
                Level::SingleWildcard => {
                    if names.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(s) => match names.next() {
                    Some(name) if name == s => {}
                    _ => return false,
                },
            }
        }

        names.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for TopicFilter {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Concrete topic a message was published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    raw: Arc<str>,
}

impl TopicName {
    /// Validate a published topic name.
    pub fn new(topic: &str) -> Result<Self> {
        let reason = if topic.is_empty() {
            Some("empty")
        } else if topic.len() > MAX_TOPIC_LEN {
            Some("exceeds 65535 bytes")
        } else if topic.contains(['+', '#']) {
            Some("contains wildcard")
        } else if topic.contains('\0') {
            Some("contains null character")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::InvalidTopicName {
                topic: topic.to_string(),
                reason,
            }),
            None => Ok(Self {
                raw: Arc::from(topic),
            }),
        }
    }

    /// The topic as published.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Levels of the topic, split on `/`.
    pub fn levels(&self) -> std::str::Split<'_, char> {
        self.raw.split('/')
    }

    /// Whether the topic is broker-reserved (`$SYS/...`).
    pub fn is_reserved(&self) -> bool {
        self.raw.starts_with('$')
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for TopicName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
