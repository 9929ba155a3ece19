//! Per-topic subscription policy and its validation.
//!
//! A [`TopicConfig`] only exists once every field has passed validation.
//! Raw, unchecked parameters live in [`RawTopicConfig`], which can be
//! deserialized from any serde source; a [`Validator`] turns them into a
//! `TopicConfig` or reports every violation at once.
//!
//! ```
//! use giztoy_mqttsub::TopicConfig;
//!
//! let config = TopicConfig::builder("device/+/state")
//!     .qos(1)
//!     .fanout_count(3)
//!     .shared_group("workers")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.physical_filter(), "$share/workers/device/+/state");
//! ```

use crate::error::{ValidationError, ValidationErrors};
use crate::topic::TopicFilter;
use crate::types::{QoS, RetainHandling};
use serde::Deserialize;
use std::num::NonZeroU32;

/// Unvalidated subscription parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawTopicConfig {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    #[serde(alias = "multisub_num")]
    pub fanout_count: u32,
    pub shared_group: Option<String>,
    #[serde(alias = "queue_topic")]
    pub queue_mode: bool,
}

impl Default for RawTopicConfig {
    fn default() -> Self {
        Self {
            filter: String::new(),
            qos: 0,
            no_local: false,
            retain_as_published: false,
            retain_handling: 0,
            fanout_count: 1,
            shared_group: None,
            queue_mode: false,
        }
    }
}

impl RawTopicConfig {
    /// Raw parameters for `filter` with protocol defaults.
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            ..Self::default()
        }
    }
}

/// Validated subscription policy. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    filter: TopicFilter,
    qos: QoS,
    no_local: bool,
    retain_as_published: bool,
    retain_handling: RetainHandling,
    fanout_count: NonZeroU32,
    shared_group: Option<String>,
    queue_mode: bool,
}

impl TopicConfig {
    /// Start building a config for `filter`.
    pub fn builder(filter: impl Into<String>) -> TopicConfigBuilder {
        TopicConfigBuilder {
            raw: RawTopicConfig::new(filter),
        }
    }

    /// Logical filter used for local routing.
    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    /// Requested maximum QoS.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Don't receive messages published on the same connection.
    pub fn no_local(&self) -> bool {
        self.no_local
    }

    /// Keep the retain flag as published instead of clearing it.
    pub fn retain_as_published(&self) -> bool {
        self.retain_as_published
    }

    /// When the broker sends retained messages.
    pub fn retain_handling(&self) -> RetainHandling {
        self.retain_handling
    }

    /// Number of parallel subscriptions ("multisub").
    pub fn fanout_count(&self) -> usize {
        self.fanout_count.get() as usize
    }

    /// Shared subscription group, if any.
    pub fn shared_group(&self) -> Option<&str> {
        self.shared_group.as_deref()
    }

    /// Whether each message goes to exactly one fan-out instance.
    pub fn queue_mode(&self) -> bool {
        self.queue_mode
    }

    /// Filter string sent to the broker.
    pub fn physical_filter(&self) -> String {
        match &self.shared_group {
            Some(group) => format!("$share/{}/{}", group, self.filter),
            None => self.filter.to_string(),
        }
    }
}

/// Builder for [`TopicConfig`]. `build` validates everything at once.
#[derive(Debug, Clone)]
pub struct TopicConfigBuilder {
    raw: RawTopicConfig,
}

impl TopicConfigBuilder {
    /// QoS level, 0 to 2.
    pub fn qos(mut self, qos: u8) -> Self {
        self.raw.qos = qos;
        self
    }

    /// Set the no-local option.
    pub fn no_local(mut self, no_local: bool) -> Self {
        self.raw.no_local = no_local;
        self
    }

    /// Set the retain-as-published option.
    pub fn retain_as_published(mut self, retain_as_published: bool) -> Self {
        self.raw.retain_as_published = retain_as_published;
        self
    }

    /// Retain handling, 0 to 2.
    pub fn retain_handling(mut self, retain_handling: u8) -> Self {
        self.raw.retain_handling = retain_handling;
        self
    }

    /// Number of fan-out slots, at least 1.
    pub fn fanout_count(mut self, count: u32) -> Self {
        self.raw.fanout_count = count;
        self
    }

    /// Subscribe through `$share/{group}/`.
    pub fn shared_group(mut self, group: impl Into<String>) -> Self {
        self.raw.shared_group = Some(group.into());
        self
    }

    /// Deliver each message to one slot at a time.
    pub fn queue_mode(mut self, queue_mode: bool) -> Self {
        self.raw.queue_mode = queue_mode;
        self
    }

    /// Validate with [`ProtocolValidator`].
    pub fn build(self) -> Result<TopicConfig, ValidationErrors> {
        self.build_with(&ProtocolValidator)
    }

    /// Validate with a caller-supplied validator.
    pub fn build_with(self, validator: &dyn Validator) -> Result<TopicConfig, ValidationErrors> {
        validator.validate(&self.raw)
    }
}

/// Turns raw parameters into a [`TopicConfig`].
pub trait Validator: Send + Sync {
    /// Validate `raw`, reporting every violation found.
    fn validate(&self, raw: &RawTopicConfig) -> Result<TopicConfig, ValidationErrors>;
}

/// Checks the MQTT protocol limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolValidator;

impl Validator for ProtocolValidator {
    fn validate(&self, raw: &RawTopicConfig) -> Result<TopicConfig, ValidationErrors> {
        validate(raw)
    }
}

/// Validate raw parameters against protocol limits.
///
/// Checks run in a fixed order (filter syntax, qos, retain handling, fan-out
/// count, shared group) and all of them run: the error lists every
/// violation, not just the first.
pub fn validate(raw: &RawTopicConfig) -> Result<TopicConfig, ValidationErrors> {
    let mut errors = Vec::new();

    let filter = TopicFilter::parse(&raw.filter)
        .map_err(|e| errors.push(e))
        .ok();

    let qos = QoS::try_from(raw.qos)
        .map_err(|v| errors.push(ValidationError::QosOutOfRange(v)))
        .ok();

    let retain_handling = RetainHandling::try_from(raw.retain_handling)
        .map_err(|v| errors.push(ValidationError::RetainHandlingOutOfRange(v)))
        .ok();

    let fanout_count = NonZeroU32::new(raw.fanout_count);
    if fanout_count.is_none() {
        errors.push(ValidationError::ZeroFanout);
    }

    if let Some(group) = &raw.shared_group {
        if group.is_empty() {
            errors.push(ValidationError::EmptySharedGroup);
        } else if group.contains(['/', '+', '#']) {
            errors.push(ValidationError::InvalidSharedGroup(group.clone()));
        }
    }

    match (filter, qos, retain_handling, fanout_count) {
        (Some(filter), Some(qos), Some(retain_handling), Some(fanout_count)) if errors.is_empty() => {
            Ok(TopicConfig {
                filter,
                qos,
                no_local: raw.no_local,
                retain_as_published: raw.retain_as_published,
                retain_handling,
                fanout_count,
                shared_group: raw.shared_group.clone(),
                queue_mode: raw.queue_mode,
            })
        }
        _ => Err(ValidationErrors::new(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = TopicConfig::builder("device/+/state").build().unwrap();
        assert_eq!(config.filter().as_str(), "device/+/state");
        assert_eq!(config.qos(), QoS::AtMostOnce);
        assert_eq!(config.retain_handling(), RetainHandling::SendAtSubscribe);
        assert_eq!(config.fanout_count(), 1);
        assert!(config.shared_group().is_none());
        assert!(!config.queue_mode());
        assert_eq!(config.physical_filter(), "device/+/state");
    }

    #[test]
    fn test_builder_all_fields() {
        let config = TopicConfig::builder("sport/#")
            .qos(2)
            .no_local(true)
            .retain_as_published(true)
            .retain_handling(2)
            .fanout_count(4)
            .shared_group("g1")
            .queue_mode(true)
            .build()
            .unwrap();

        assert_eq!(config.qos(), QoS::ExactlyOnce);
        assert!(config.no_local());
        assert!(config.retain_as_published());
        assert_eq!(config.retain_handling(), RetainHandling::DoNotSend);
        assert_eq!(config.fanout_count(), 4);
        assert_eq!(config.shared_group(), Some("g1"));
        assert!(config.queue_mode());
        assert_eq!(config.physical_filter(), "$share/g1/sport/#");
    }

    #[test]
    fn test_collects_all_violations_in_order() {
        let raw = RawTopicConfig {
            filter: "a/#/b".to_string(),
            qos: 3,
            retain_handling: 9,
            fanout_count: 0,
            shared_group: Some("bad/group".to_string()),
            ..RawTopicConfig::default()
        };

        let errs = validate(&raw).unwrap_err();
        assert_eq!(
            errs.errors(),
            &[
                ValidationError::MultiWildcardNotLast("a/#/b".to_string()),
                ValidationError::QosOutOfRange(3),
                ValidationError::RetainHandlingOutOfRange(9),
                ValidationError::ZeroFanout,
                ValidationError::InvalidSharedGroup("bad/group".to_string()),
            ]
        );
    }

    #[test]
    fn test_single_violation() {
        let errs = TopicConfig::builder("a/b").qos(5).build().unwrap_err();
        assert_eq!(errs.errors(), &[ValidationError::QosOutOfRange(5)]);
    }

    #[test]
    fn test_shared_group_rules() {
        let errs = TopicConfig::builder("a").shared_group("").build().unwrap_err();
        assert_eq!(errs.errors(), &[ValidationError::EmptySharedGroup]);

        for group in ["g+", "g#", "a/b"] {
            let errs = TopicConfig::builder("a").shared_group(group).build().unwrap_err();
            assert_eq!(
                errs.errors(),
                &[ValidationError::InvalidSharedGroup(group.to_string())]
            );
        }
    }

    #[test]
    fn test_empty_filter() {
        let errs = TopicConfig::builder("").build().unwrap_err();
        assert_eq!(errs.errors(), &[ValidationError::EmptyFilter]);
    }

    #[test]
    fn test_custom_validator() {
        struct NoWildcards;

        impl Validator for NoWildcards {
            fn validate(&self, raw: &RawTopicConfig) -> Result<TopicConfig, ValidationErrors> {
                let config = validate(raw)?;
                if config.filter().has_wildcards() {
                    return Err(ValidationError::SingleWildcardNotAlone(raw.filter.clone()).into());
                }
                Ok(config)
            }
        }

        assert!(TopicConfig::builder("a/b").build_with(&NoWildcards).is_ok());
        assert!(TopicConfig::builder("a/+").build_with(&NoWildcards).is_err());
    }

    #[test]
    fn test_deserialize_raw() {
        let raw: RawTopicConfig = serde_json::from_str(
            r#"{"filter": "device/+/stats", "qos": 1, "multisub_num": 3, "shared_group": "g", "queue_topic": true}"#,
        )
        .unwrap();

        assert_eq!(raw.fanout_count, 3);
        assert_eq!(raw.shared_group.as_deref(), Some("g"));
        assert!(raw.queue_mode);

        let config = ProtocolValidator.validate(&raw).unwrap();
        assert_eq!(config.physical_filter(), "$share/g/device/+/stats");
    }

    #[test]
    fn test_deserialize_defaults() {
        let raw: RawTopicConfig = serde_json::from_str(r#"{"filter": "a"}"#).unwrap();
        assert_eq!(raw, RawTopicConfig::new("a"));
        assert_eq!(raw.fanout_count, 1);
    }
}
