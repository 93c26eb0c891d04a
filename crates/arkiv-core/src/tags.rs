//! Ticket-side tag state machine.
//!
//! Four tags externalise job state on the ticket: the trigger tag requests
//! archival, and processing/done/error track the outcome. `{trigger, done,
//! error}` are mutually exclusive at steady state; the processing tag may
//! transiently coexist and is removed on every terminal transition.
//!
//! Transitions are expressed as pure `(add, remove)` sets so they can be
//! tested without a TMS and replayed idempotently: applying the same
//! transition twice leaves the ticket in the same state.

use serde::{Deserialize, Serialize};

/// Configurable names for the four state tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagNames {
    /// Tag whose presence requests archival.
    #[serde(default = "default_trigger")]
    pub trigger: String,

    /// Tag set while a job is running.
    #[serde(default = "default_processing")]
    pub processing: String,

    /// Tag set after successful archival.
    #[serde(default = "default_done")]
    pub done: String,

    /// Tag set after a failed job.
    #[serde(default = "default_error")]
    pub error: String,
}

fn default_trigger() -> String {
    "pdf:sign".to_owned()
}

fn default_processing() -> String {
    "pdf:processing".to_owned()
}

fn default_done() -> String {
    "pdf:signed".to_owned()
}

fn default_error() -> String {
    "pdf:error".to_owned()
}

impl Default for TagNames {
    fn default() -> Self {
        Self {
            trigger: default_trigger(),
            processing: default_processing(),
            done: default_done(),
            error: default_error(),
        }
    }
}

/// The add/remove sets produced by one transition action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagTransition {
    /// Tags to add, in application order.
    pub add: Vec<String>,
    /// Tags to remove, in application order.
    pub remove: Vec<String>,
}

impl TagNames {
    /// Transition: any state → processing.
    #[must_use]
    pub fn apply_processing(&self) -> TagTransition {
        TagTransition {
            add: vec![self.processing.clone()],
            remove: vec![
                self.done.clone(),
                self.error.clone(),
                self.trigger.clone(),
            ],
        }
    }

    /// Transition: any state → done.
    #[must_use]
    pub fn apply_done(&self) -> TagTransition {
        TagTransition {
            add: vec![self.done.clone()],
            remove: vec![
                self.processing.clone(),
                self.error.clone(),
                self.trigger.clone(),
            ],
        }
    }

    /// Transition: any state → error.
    ///
    /// `keep_trigger` is true for transient failures (the trigger tag is
    /// restored so a replay can re-run the job) and false for permanent
    /// ones.
    #[must_use]
    pub fn apply_error(&self, keep_trigger: bool) -> TagTransition {
        let mut add = vec![self.error.clone()];
        let mut remove = vec![self.processing.clone(), self.done.clone()];
        if keep_trigger {
            add.push(self.trigger.clone());
        } else {
            remove.push(self.trigger.clone());
        }
        TagTransition { add, remove }
    }

    /// Eligibility gate evaluated on the ticket's current tags.
    ///
    /// False when the done tag is present, false when the trigger tag is
    /// required but absent, true otherwise.
    #[must_use]
    pub fn should_process<S: AsRef<str>>(&self, current_tags: &[S], require_trigger: bool) -> bool {
        let has = |needle: &str| current_tags.iter().any(|tag| tag.as_ref() == needle);
        if has(&self.done) {
            return false;
        }
        if require_trigger {
            return has(&self.trigger);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn apply(tags: &BTreeSet<String>, transition: &TagTransition) -> BTreeSet<String> {
        let mut out = tags.clone();
        for tag in &transition.remove {
            out.remove(tag);
        }
        for tag in &transition.add {
            out.insert(tag.clone());
        }
        out
    }

    fn set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| (*t).to_owned()).collect()
    }

    #[test]
    fn processing_clears_terminal_tags_and_trigger() {
        let names = TagNames::default();
        let transition = names.apply_processing();
        let out = apply(&set(&["pdf:sign", "pdf:error", "urgent"]), &transition);
        assert_eq!(out, set(&["pdf:processing", "urgent"]));
    }

    #[test]
    fn done_leaves_only_done_from_any_prior_subset() {
        let names = TagNames::default();
        let priors = [
            set(&[]),
            set(&["pdf:sign"]),
            set(&["pdf:processing"]),
            set(&["pdf:sign", "pdf:processing", "pdf:error"]),
            set(&["pdf:signed"]),
        ];
        for prior in priors {
            let after_processing = apply(&prior, &names.apply_processing());
            let after_done = apply(&after_processing, &names.apply_done());
            let state_tags: BTreeSet<String> = after_done
                .iter()
                .filter(|t| {
                    [&names.trigger, &names.processing, &names.done, &names.error]
                        .iter()
                        .any(|n| *n == *t)
                })
                .cloned()
                .collect();
            assert_eq!(state_tags, set(&["pdf:signed"]), "prior: {prior:?}");
        }
    }

    #[test]
    fn error_keep_trigger_mirrors_classification() {
        let names = TagNames::default();

        let transient = names.apply_error(true);
        let out = apply(&set(&["pdf:processing"]), &transient);
        assert_eq!(out, set(&["pdf:error", "pdf:sign"]));

        let permanent = names.apply_error(false);
        let out = apply(&set(&["pdf:processing", "pdf:sign"]), &permanent);
        assert_eq!(out, set(&["pdf:error"]));
    }

    #[test]
    fn transitions_are_idempotent() {
        let names = TagNames::default();
        for transition in [
            names.apply_processing(),
            names.apply_done(),
            names.apply_error(true),
            names.apply_error(false),
        ] {
            let once = apply(&set(&["pdf:sign", "pdf:processing"]), &transition);
            let twice = apply(&once, &transition);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn should_process_gate() {
        let names = TagNames::default();

        assert!(names.should_process(&["pdf:sign"], true));
        assert!(!names.should_process(&["pdf:signed", "pdf:sign"], true));
        assert!(!names.should_process::<&str>(&[], true));
        assert!(names.should_process::<&str>(&[], false));
        assert!(!names.should_process(&["pdf:signed"], false));
        // Unrelated tags are ignored.
        assert!(names.should_process(&["urgent", "pdf:sign"], true));
    }

    #[test]
    fn custom_tag_names_are_honoured() {
        let names = TagNames {
            trigger: "archive:go".into(),
            processing: "archive:busy".into(),
            done: "archive:ok".into(),
            error: "archive:bad".into(),
        };
        let transition = names.apply_done();
        assert_eq!(transition.add, vec!["archive:ok".to_owned()]);
        assert!(transition.remove.contains(&"archive:go".to_owned()));
        assert!(names.should_process(&["archive:go"], true));
    }
}
