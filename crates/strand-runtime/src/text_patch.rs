#![forbid(unsafe_code)]

//! In-place value patching for live text controls.
//!
//! When the store reports a string insert or remove on a path bound to the
//! `value` of an `<input>`/`<textarea>`, replacing the whole value would
//! reset the caret under the user's fingers. Instead the edit is replayed
//! on the control's current value and the selection is shifted around it.
//!
//! | provenance                      | action                                  |
//! |---------------------------------|-----------------------------------------|
//! | `Local` from this control       | nothing (the control already shows it)  |
//! | `StringInsert` / `StringRemove` | splice, shift selection, keep scroll    |
//! | anything else, or none          | the wrapped binding's own update        |
//!
//! All offsets are char (Unicode scalar) indices and clamp to the value.

use std::rc::Rc;

use strand_core::Provenance;
use tracing::trace;

use crate::error::BindingError;
use crate::view::{Binding, Context, Expression, Notification, Selection, TextControl};

/// What [`apply`] did to the control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The change came from this control.
    SkippedLocal,
    /// The control already shows the result.
    AlreadyCurrent,
    Inserted,
    Removed,
    /// Not patchable; use the default update.
    Fallback,
}

impl PatchOutcome {
    /// Whether the caller still has to run the default update.
    #[must_use]
    pub const fn needs_default_update(self) -> bool {
        matches!(self, Self::Fallback)
    }
}

/// Patch `control` for a change carrying `provenance`.
///
/// With `patching` off only the same-control skip applies.
pub fn apply(
    control: &dyn TextControl,
    provenance: Option<&Provenance>,
    patching: bool,
) -> PatchOutcome {
    match provenance {
        Some(Provenance::Local { origin }) if *origin == control.element_id() => {
            PatchOutcome::SkippedLocal
        }
        Some(Provenance::StringInsert {
            previous,
            index,
            text,
        }) if patching => {
            let current = control.value();
            if current == splice_insert(previous, *index, text) {
                return PatchOutcome::AlreadyCurrent;
            }
            let at = (*index).min(char_len(&current));
            let inserted = char_len(text);
            let next = splice_insert(&current, at, text);
            write(control, &next, |offset| shift_for_insert(offset, at, inserted));
            PatchOutcome::Inserted
        }
        Some(Provenance::StringRemove {
            previous,
            index,
            count,
        }) if patching => {
            let current = control.value();
            if current == splice_remove(previous, *index, *count) {
                return PatchOutcome::AlreadyCurrent;
            }
            let len = char_len(&current);
            let start = (*index).min(len);
            let end = start.saturating_add(*count).min(len);
            let next = splice_remove(&current, start, end - start);
            write(control, &next, |offset| shift_for_remove(offset, start, end));
            PatchOutcome::Removed
        }
        _ => PatchOutcome::Fallback,
    }
}

/// Replace the control's value, keeping scroll and (if focused) selection.
fn write(control: &dyn TextControl, value: &str, shift: impl Fn(usize) -> usize) {
    let scroll_top = control.scroll_top();
    let len = char_len(value);
    if control.is_focused() {
        let selection = control.selection();
        control.set_value(value);
        control.set_selection(Selection::new(
            shift(selection.start).min(len),
            shift(selection.end).min(len),
        ));
    } else {
        control.set_value(value);
    }
    control.set_scroll_top(scroll_top);
}

#[must_use]
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of char `index`, clamped to the end of `s`.
fn byte_offset(s: &str, index: usize) -> usize {
    s.char_indices().nth(index).map_or(s.len(), |(at, _)| at)
}

/// `s` with `text` inserted at char `index` (clamped).
#[must_use]
pub fn splice_insert(s: &str, index: usize, text: &str) -> String {
    let at = byte_offset(s, index);
    let mut out = String::with_capacity(s.len() + text.len());
    out.push_str(&s[..at]);
    out.push_str(text);
    out.push_str(&s[at..]);
    out
}

/// `s` without the `count` chars starting at char `index` (clamped).
#[must_use]
pub fn splice_remove(s: &str, index: usize, count: usize) -> String {
    let start = byte_offset(s, index);
    let end = byte_offset(s, index.saturating_add(count));
    let mut out = String::with_capacity(s.len() - (end - start));
    out.push_str(&s[..start]);
    out.push_str(&s[end..]);
    out
}

/// Selection offset after inserting `len` chars at `index`.
#[must_use]
pub const fn shift_for_insert(offset: usize, index: usize, len: usize) -> usize {
    if offset >= index {
        offset.saturating_add(len)
    } else {
        offset
    }
}

/// Selection offset after removing the chars in `start..end`.
#[must_use]
pub const fn shift_for_remove(offset: usize, start: usize, end: usize) -> usize {
    if offset >= end {
        offset - (end - start)
    } else if offset > start {
        start
    } else {
        offset
    }
}

/// Wraps a binding on a text control's `value`, patching in place when the
/// change provenance allows it.
pub struct TextPatchBinding {
    inner: Rc<dyn Binding>,
    control: Rc<dyn TextControl>,
    patching: bool,
}

impl TextPatchBinding {
    #[must_use]
    pub fn new(inner: Rc<dyn Binding>, control: Rc<dyn TextControl>, patching: bool) -> Self {
        Self {
            inner,
            control,
            patching,
        }
    }

    #[must_use]
    pub fn inner(&self) -> &Rc<dyn Binding> {
        &self.inner
    }
}

impl Binding for TextPatchBinding {
    fn expressions(&self) -> &[Rc<dyn Expression>] {
        self.inner.expressions()
    }

    fn context(&self) -> &Context {
        self.inner.context()
    }

    fn update(&self, notification: &Notification) -> Result<(), BindingError> {
        let outcome = apply(
            self.control.as_ref(),
            notification.provenance(),
            self.patching,
        );
        trace!(element = %self.control.element_id(), ?outcome, "text patch");
        if outcome.needs_default_update() {
            self.inner.update(notification)
        } else {
            Ok(())
        }
    }

    fn is_attached(&self) -> bool {
        self.inner.is_attached() && self.control.is_attached()
    }

    fn text_target(&self) -> Option<Rc<dyn TextControl>> {
        Some(Rc::clone(&self.control))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use strand_core::ElementId;

    struct Control {
        id: ElementId,
        value: RefCell<String>,
        selection: Cell<Selection>,
        focused: Cell<bool>,
        scroll: Cell<i32>,
        writes: Cell<u32>,
    }

    impl Control {
        fn new(value: &str, caret: usize) -> Self {
            Self {
                id: ElementId(1),
                value: RefCell::new(value.to_owned()),
                selection: Cell::new(Selection::caret(caret)),
                focused: Cell::new(true),
                scroll: Cell::new(40),
                writes: Cell::new(0),
            }
        }
    }

    impl TextControl for Control {
        fn element_id(&self) -> ElementId {
            self.id
        }
        fn value(&self) -> String {
            self.value.borrow().clone()
        }
        fn set_value(&self, value: &str) {
            self.writes.set(self.writes.get() + 1);
            *self.value.borrow_mut() = value.to_owned();
            // browsers reset the caret and scroll on value assignment
            self.selection.set(Selection::caret(value.chars().count()));
            self.scroll.set(0);
        }
        fn selection(&self) -> Selection {
            self.selection.get()
        }
        fn set_selection(&self, selection: Selection) {
            self.selection.set(selection);
        }
        fn is_focused(&self) -> bool {
            self.focused.get()
        }
        fn scroll_top(&self) -> i32 {
            self.scroll.get()
        }
        fn set_scroll_top(&self, scroll_top: i32) {
            self.scroll.set(scroll_top);
        }
    }

    fn insert(previous: &str, index: usize, text: &str) -> Provenance {
        Provenance::StringInsert {
            previous: previous.into(),
            index,
            text: text.into(),
        }
    }

    fn remove(previous: &str, index: usize, count: usize) -> Provenance {
        Provenance::StringRemove {
            previous: previous.into(),
            index,
            count,
        }
    }

    #[test]
    fn local_change_from_same_control_is_skipped() {
        let control = Control::new("hello", 5);
        let pass = Provenance::Local {
            origin: ElementId(1),
        };
        assert_eq!(apply(&control, Some(&pass), true), PatchOutcome::SkippedLocal);
        assert_eq!(apply(&control, Some(&pass), false), PatchOutcome::SkippedLocal);
        assert_eq!(control.value(), "hello");
        assert_eq!(control.writes.get(), 0);
    }

    #[test]
    fn local_change_from_other_control_falls_back() {
        let control = Control::new("hello", 5);
        let pass = Provenance::Local {
            origin: ElementId(2),
        };
        assert_eq!(apply(&control, Some(&pass), true), PatchOutcome::Fallback);
    }

    #[test]
    fn insert_already_applied_is_noop() {
        let control = Control::new("hello world", 5);
        let pass = insert("hello", 5, " world");
        assert_eq!(apply(&control, Some(&pass), true), PatchOutcome::AlreadyCurrent);
        assert_eq!(control.selection(), Selection::caret(5));
        assert_eq!(control.writes.get(), 0);
    }

    #[test]
    fn remote_insert_before_caret_shifts_it() {
        // user is typing at the end of "world"; a remote insert lands at 0
        let control = Control::new("world", 5);
        let pass = insert("world", 0, "hi ");
        assert_eq!(apply(&control, Some(&pass), true), PatchOutcome::Inserted);
        assert_eq!(control.value(), "hi world");
        assert_eq!(control.selection(), Selection::caret(8));
        assert_eq!(control.scroll_top(), 40);
    }

    #[test]
    fn insert_after_caret_leaves_it() {
        let control = Control::new("abcd", 1);
        apply(&control, Some(&insert("abcd", 3, "XY")), true);
        assert_eq!(control.value(), "abcXYd");
        assert_eq!(control.selection(), Selection::caret(1));
    }

    #[test]
    fn insert_index_clamps_to_value() {
        let control = Control::new("ab", 0);
        apply(&control, Some(&insert("abcdef", 6, "!")), true);
        assert_eq!(control.value(), "ab!");
    }

    #[test]
    fn remove_shifts_and_clamps_selection() {
        let control = Control::new("abcdefgh", 0);
        control.set_selection(Selection::new(3, 7));
        apply(&control, Some(&remove("abcdefgh", 2, 3)), true);
        assert_eq!(control.value(), "abfgh");
        // 3 was inside 2..5 and clamps to 2; 7 shifts left by 3
        assert_eq!(control.selection(), Selection::new(2, 4));
    }

    #[test]
    fn remove_already_applied_is_noop() {
        let control = Control::new("abfgh", 1);
        let pass = remove("abcdefgh", 2, 3);
        assert_eq!(apply(&control, Some(&pass), true), PatchOutcome::AlreadyCurrent);
        assert_eq!(control.writes.get(), 0);
    }

    #[test]
    fn unfocused_control_keeps_default_caret() {
        let control = Control::new("abc", 1);
        control.focused.set(false);
        apply(&control, Some(&insert("abc", 0, "z")), true);
        assert_eq!(control.value(), "zabc");
        assert_eq!(control.selection(), Selection::caret(4));
        assert_eq!(control.scroll_top(), 40);
    }

    #[test]
    fn offsets_are_chars_not_bytes() {
        let control = Control::new("héllo", 5);
        apply(&control, Some(&insert("héllo", 2, "ü")), true);
        assert_eq!(control.value(), "héüllo");
        assert_eq!(control.selection(), Selection::caret(6));
    }

    #[test]
    fn disabled_patching_falls_back() {
        let control = Control::new("abc", 0);
        assert_eq!(
            apply(&control, Some(&insert("ab", 2, "c")), false),
            PatchOutcome::Fallback
        );
        assert_eq!(apply(&control, None, true), PatchOutcome::Fallback);
    }

    #[test]
    fn splice_helpers_clamp() {
        assert_eq!(splice_insert("ab", 99, "c"), "abc");
        assert_eq!(splice_remove("abc", 1, 99), "a");
        assert_eq!(splice_remove("abc", 9, 1), "abc");
        assert_eq!(shift_for_remove(1, 2, 5), 1);
        assert_eq!(shift_for_remove(5, 2, 5), 2);
        assert_eq!(shift_for_insert(2, 2, 3), 5);
    }
}
