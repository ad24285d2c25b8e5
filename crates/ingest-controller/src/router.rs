//! Stream admission and priority tracking.
//!
//! The router decides *whether* a stream may be scheduled; the coordinator
//! decides *when*. Admission runs an ordered list of [`AdmissionRule`]s and
//! stops at the first failure. Admitted streams keep a priority that only ever
//! rises while the stream is admitted.

use crate::errors::IngestError;
use crate::events::{EventSink, RouterEvent};
use crate::observability::metrics;

use chrono::{DateTime, Utc};
use media_protocol::StreamDescription;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Smallest accepted resolution (width, height).
pub const MIN_RESOLUTION: (u32, u32) = (320, 240);

/// Largest accepted resolution (width, height).
pub const MAX_RESOLUTION: (u32, u32) = (3840, 2160);

/// A named admission predicate.
pub trait AdmissionRule: Send + Sync {
    /// Stable identifier reported when the rule rejects a stream.
    fn name(&self) -> &str;

    /// Returns true if the stream may be admitted.
    fn check(&self, description: &StreamDescription) -> bool;
}

/// Stream ID, user ID and configuration must all be present.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequiredFieldsRule;

impl AdmissionRule for RequiredFieldsRule {
    fn name(&self) -> &str {
        "required_fields"
    }

    fn check(&self, description: &StreamDescription) -> bool {
        description.stream_id.is_some()
            && description.user_id.is_some()
            && description.config.is_some()
    }
}

/// At least one frame must be available.
#[derive(Debug, Default, Clone, Copy)]
pub struct HasFramesRule;

impl AdmissionRule for HasFramesRule {
    fn name(&self) -> &str {
        "has_frames"
    }

    fn check(&self, description: &StreamDescription) -> bool {
        !description.frames.is_empty()
    }
}

/// Resolution must lie within [`MIN_RESOLUTION`] and [`MAX_RESOLUTION`].
#[derive(Debug, Clone, Copy)]
pub struct ResolutionRangeRule {
    min: (u32, u32),
    max: (u32, u32),
}

impl ResolutionRangeRule {
    #[must_use]
    pub const fn new(min: (u32, u32), max: (u32, u32)) -> Self {
        Self { min, max }
    }
}

impl Default for ResolutionRangeRule {
    fn default() -> Self {
        Self::new(MIN_RESOLUTION, MAX_RESOLUTION)
    }
}

impl AdmissionRule for ResolutionRangeRule {
    fn name(&self) -> &str {
        "resolution_range"
    }

    fn check(&self, description: &StreamDescription) -> bool {
        description.config.is_some_and(|config| {
            (self.min.0..=self.max.0).contains(&config.width)
                && (self.min.1..=self.max.1).contains(&config.height)
        })
    }
}

#[derive(Debug, Clone)]
struct Admission {
    stream_id: String,
    priority: u32,
    admitted_at: DateTime<Utc>,
}

/// Tracks admitted streams and evaluates admission rules.
pub struct StreamRouter {
    /// Ordered by first admission; ties in `next_candidate` go to the earliest.
    admissions: RwLock<Vec<Admission>>,
    rules: RwLock<Vec<Arc<dyn AdmissionRule>>>,
    events: EventSink,
}

impl std::fmt::Debug for StreamRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRouter")
            .field("admitted", &self.admitted_count())
            .field("rules", &self.rule_names())
            .finish_non_exhaustive()
    }
}

impl StreamRouter {
    /// Create a router with the default rule set:
    /// `required_fields`, `has_frames`, `resolution_range`.
    #[must_use]
    pub fn new(events: EventSink) -> Self {
        let rules: Vec<Arc<dyn AdmissionRule>> = vec![
            Arc::new(RequiredFieldsRule),
            Arc::new(HasFramesRule),
            Arc::new(ResolutionRangeRule::default()),
        ];
        Self::with_rules(rules, events)
    }

    /// Create a router with an explicit rule list.
    #[must_use]
    pub fn with_rules(rules: Vec<Arc<dyn AdmissionRule>>, events: EventSink) -> Self {
        Self {
            admissions: RwLock::new(Vec::new()),
            rules: RwLock::new(rules),
            events,
        }
    }

    /// Admit a stream, or raise its priority to `max(current, priority)`.
    ///
    /// Returns the effective priority. Emits `Admitted` then a
    /// `SchedulingHint` naming the best candidate; never dequeues anything.
    pub fn admit(&self, stream_id: &str, priority: u32) -> u32 {
        let effective = {
            let mut admissions = self.admissions.write();
            if let Some(existing) = admissions.iter_mut().find(|a| a.stream_id == stream_id) {
                existing.priority = existing.priority.max(priority);
                existing.priority
            } else {
                admissions.push(Admission {
                    stream_id: stream_id.to_string(),
                    priority,
                    admitted_at: Utc::now(),
                });
                priority
            }
        };

        debug!(
            target: "ingest.router",
            stream_id = %stream_id,
            priority = effective,
            "Stream admitted"
        );
        self.events.emit(RouterEvent::Admitted {
            stream_id: stream_id.to_string(),
            priority: effective,
        });
        self.events.emit(RouterEvent::SchedulingHint {
            next_candidate: self.next_candidate(),
        });

        effective
    }

    /// Withdraw a stream's admission. Returns true if it was admitted.
    pub fn withdraw(&self, stream_id: &str) -> bool {
        let removed = {
            let mut admissions = self.admissions.write();
            let before = admissions.len();
            admissions.retain(|a| a.stream_id != stream_id);
            admissions.len() != before
        };

        if removed {
            debug!(target: "ingest.router", stream_id = %stream_id, "Admission withdrawn");
            self.events.emit(RouterEvent::Withdrawn {
                stream_id: stream_id.to_string(),
            });
        }
        removed
    }

    #[must_use]
    pub fn is_admitted(&self, stream_id: &str) -> bool {
        self.admissions
            .read()
            .iter()
            .any(|a| a.stream_id == stream_id)
    }

    #[must_use]
    pub fn priority_of(&self, stream_id: &str) -> Option<u32> {
        self.admissions
            .read()
            .iter()
            .find(|a| a.stream_id == stream_id)
            .map(|a| a.priority)
    }

    /// When the stream was first admitted.
    #[must_use]
    pub fn admitted_at(&self, stream_id: &str) -> Option<DateTime<Utc>> {
        self.admissions
            .read()
            .iter()
            .find(|a| a.stream_id == stream_id)
            .map(|a| a.admitted_at)
    }

    #[must_use]
    pub fn admitted_count(&self) -> usize {
        self.admissions.read().len()
    }

    /// Highest-priority admitted stream; earliest admission wins ties.
    ///
    /// Advisory only: the router does not know which streams are in flight.
    #[must_use]
    pub fn next_candidate(&self) -> Option<String> {
        let admissions = self.admissions.read();
        let mut best: Option<&Admission> = None;
        for admission in admissions.iter() {
            if best.map_or(true, |b| admission.priority > b.priority) {
                best = Some(admission);
            }
        }
        best.map(|a| a.stream_id.clone())
    }

    /// Run the admission rules in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Admission` naming the failed rule.
    pub fn evaluate(&self, description: &StreamDescription) -> Result<(), IngestError> {
        let rules = self.rules.read().clone();
        for rule in &rules {
            if rule.check(description) {
                continue;
            }

            let rule_name = rule.name().to_string();
            let stream_id = description.stream_id().unwrap_or_default().to_string();
            info!(
                target: "ingest.router",
                stream_id = %stream_id,
                rule = %rule_name,
                "Admission rule rejected stream"
            );
            metrics::record_admission_rejected(&rule_name);
            self.events.emit(RouterEvent::RuleFailed {
                stream_id,
                rule: rule_name.clone(),
            });
            return Err(IngestError::Admission { rule: rule_name });
        }
        Ok(())
    }

    /// Append a rule, replacing any existing rule with the same name in place.
    pub fn add_rule(&self, rule: Arc<dyn AdmissionRule>) {
        let mut rules = self.rules.write();
        if let Some(slot) = rules.iter_mut().find(|r| r.name() == rule.name()) {
            *slot = rule;
        } else {
            rules.push(rule);
        }
    }

    /// Remove a rule by name. Returns true if it existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name() != name);
        rules.len() != before
    }

    /// Names of the active rules, in evaluation order.
    #[must_use]
    pub fn rule_names(&self) -> Vec<String> {
        self.rules
            .read()
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::PipelineEvent;
    use media_protocol::{Frame, FrameFormat, StreamConfig};

    fn description(width: u32, height: u32, frames: usize) -> StreamDescription {
        StreamDescription::new(
            "stream-1",
            "user-1",
            StreamConfig {
                width,
                height,
                frame_rate: 30,
                bitrate: 2_000_000,
                audio_enabled: false,
            },
            (0..frames)
                .map(|ts| Frame::new(vec![1u8; 8], ts as u64, width, height, FrameFormat::I420))
                .collect(),
        )
    }

    struct NamedRule(&'static str, bool);

    impl AdmissionRule for NamedRule {
        fn name(&self) -> &str {
            self.0
        }

        fn check(&self, _: &StreamDescription) -> bool {
            self.1
        }
    }

    #[test]
    fn test_readmission_keeps_max_priority() {
        let router = StreamRouter::new(EventSink::disabled());

        assert_eq!(router.admit("s2", 1), 1);
        assert_eq!(router.admit("s2", 5), 5);
        assert_eq!(router.admit("s2", 3), 5);

        assert_eq!(router.admitted_count(), 1);
        assert_eq!(router.priority_of("s2"), Some(5));
        assert_eq!(router.next_candidate().as_deref(), Some("s2"));
    }

    #[test]
    fn test_next_candidate_prefers_priority_then_first_admitted() {
        let router = StreamRouter::new(EventSink::disabled());
        router.admit("a", 2);
        router.admit("b", 7);
        router.admit("c", 7);

        assert_eq!(router.next_candidate().as_deref(), Some("b"));

        router.withdraw("b");
        assert_eq!(router.next_candidate().as_deref(), Some("c"));
    }

    #[test]
    fn test_next_candidate_empty() {
        let router = StreamRouter::new(EventSink::disabled());
        assert!(router.next_candidate().is_none());
    }

    #[test]
    fn test_admit_emits_admitted_then_hint() {
        let (sink, mut rx) = EventSink::channel();
        let router = StreamRouter::new(sink);
        router.admit("s1", 4);

        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Router(RouterEvent::Admitted {
                stream_id: "s1".to_string(),
                priority: 4
            })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Router(RouterEvent::SchedulingHint {
                next_candidate: Some("s1".to_string())
            })
        );
    }

    #[test]
    fn test_withdraw_is_idempotent() {
        let router = StreamRouter::new(EventSink::disabled());
        router.admit("s1", 1);

        assert!(router.withdraw("s1"));
        assert!(!router.withdraw("s1"));
        assert!(!router.is_admitted("s1"));
        assert!(router.priority_of("s1").is_none());
    }

    #[test]
    fn test_default_rules_accept_valid_stream() {
        let router = StreamRouter::new(EventSink::disabled());
        assert!(router.evaluate(&description(640, 480, 3)).is_ok());
        assert_eq!(
            router.rule_names(),
            vec!["required_fields", "has_frames", "resolution_range"]
        );
    }

    #[test]
    fn test_missing_fields_fail_first_rule() {
        let router = StreamRouter::new(EventSink::disabled());
        let mut desc = description(640, 480, 3);
        desc.user_id = None;

        let err = router.evaluate(&desc).unwrap_err();
        assert!(matches!(err, IngestError::Admission { rule } if rule == "required_fields"));
    }

    #[test]
    fn test_no_frames_rejected() {
        let (sink, mut rx) = EventSink::channel();
        let router = StreamRouter::new(sink);

        let err = router.evaluate(&description(640, 480, 0)).unwrap_err();
        assert!(matches!(err, IngestError::Admission { rule } if rule == "has_frames"));
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Router(RouterEvent::RuleFailed {
                stream_id: "stream-1".to_string(),
                rule: "has_frames".to_string()
            })
        );
    }

    #[test]
    fn test_resolution_bounds() {
        let router = StreamRouter::new(EventSink::disabled());

        assert!(router.evaluate(&description(320, 240, 1)).is_ok());
        assert!(router.evaluate(&description(3840, 2160, 1)).is_ok());

        for (w, h) in [(319, 240), (320, 239), (3841, 2160), (3840, 2161)] {
            let err = router.evaluate(&description(w, h, 1)).unwrap_err();
            assert!(
                matches!(&err, IngestError::Admission { rule } if rule == "resolution_range"),
                "{w}x{h} should be out of range"
            );
        }
    }

    #[test]
    fn test_add_rule_replaces_by_name() {
        let router = StreamRouter::new(EventSink::disabled());

        router.add_rule(Arc::new(NamedRule("has_frames", true)));
        assert_eq!(router.rule_names().len(), 3);
        assert!(router.evaluate(&description(640, 480, 0)).is_ok());

        router.add_rule(Arc::new(NamedRule("business_hours", false)));
        assert_eq!(router.rule_names().last().map(String::as_str), Some("business_hours"));
        let err = router.evaluate(&description(640, 480, 1)).unwrap_err();
        assert!(matches!(err, IngestError::Admission { rule } if rule == "business_hours"));
    }

    #[test]
    fn test_remove_rule() {
        let router = StreamRouter::new(EventSink::disabled());

        assert!(router.remove_rule("resolution_range"));
        assert!(!router.remove_rule("resolution_range"));
        assert!(router.evaluate(&description(8000, 8000, 1)).is_ok());
    }
}
