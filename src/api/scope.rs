//! RAII tag scopes.

use std::marker::PhantomData;

use crate::api::tag::{TagData, TagHandle};
use crate::api::tracker::LowLevelTracker;

/// Makes a tag the current thread's active tag until dropped.
///
/// Scopes nest: dropping one restores the tag that was active before it.
/// They must be dropped in reverse order of creation, on the thread that
/// created them.
///
/// ```
/// use tagtrack::{TagDeclaration, TrackerBuilder, TrackerConfig};
///
/// let tracker = TrackerBuilder::new(TrackerConfig::default())
///     .declare_tag(TagDeclaration::new("Audio"))
///     .build()
///     .unwrap();
///
/// let audio = tracker.find_tag("Audio").unwrap();
/// {
///     let _scope = tracker.scope(audio);
///     assert_eq!(tracker.active_tag().name(), "Audio");
/// }
/// assert_eq!(tracker.active_tag().name(), "Untagged");
/// ```
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct TagScope<'a> {
    tracker: &'a LowLevelTracker,
    /// `None` if the push failed; nothing is popped then.
    tag: Option<TagHandle>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> TagScope<'a> {
    pub(crate) fn enter(tracker: &'a LowLevelTracker, tag: TagHandle) -> Self {
        let pushed = tracker.push_scope(tag);
        Self {
            tracker,
            tag: pushed.then_some(tag),
            _not_send: PhantomData,
        }
    }

    /// The tag this scope made active.
    pub fn tag(&self) -> &'a TagData {
        match self.tag {
            Some(tag) => tag.get(),
            None => self.tracker.untagged(),
        }
    }
}

impl Drop for TagScope<'_> {
    fn drop(&mut self) {
        if let Some(tag) = self.tag {
            self.tracker.pop_scope(tag);
        }
    }
}
