#![no_main]

use std::cell::{Cell, RefCell};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use strand_core::{ElementId, Provenance};
use strand_runtime::text_patch::{apply, char_len, splice_insert, splice_remove};
use strand_runtime::{PatchOutcome, Selection, TextControl};

#[derive(Arbitrary, Debug)]
struct Input {
    current: String,
    previous: String,
    text: String,
    index: u16,
    count: u16,
    selection: (u16, u16),
    focused: bool,
    remove: bool,
    patching: bool,
}

struct Control {
    value: RefCell<String>,
    selection: Cell<Selection>,
    focused: bool,
    scroll: Cell<i32>,
}

impl TextControl for Control {
    fn element_id(&self) -> ElementId {
        ElementId(1)
    }
    fn value(&self) -> String {
        self.value.borrow().clone()
    }
    fn set_value(&self, value: &str) {
        *self.value.borrow_mut() = value.to_owned();
        self.selection.set(Selection::caret(char_len(value)));
        self.scroll.set(0);
    }
    fn selection(&self) -> Selection {
        self.selection.get()
    }
    fn set_selection(&self, selection: Selection) {
        self.selection.set(selection);
    }
    fn is_focused(&self) -> bool {
        self.focused
    }
    fn scroll_top(&self) -> i32 {
        self.scroll.get()
    }
    fn set_scroll_top(&self, scroll_top: i32) {
        self.scroll.set(scroll_top);
    }
}

fuzz_target!(|input: Input| {
    let index = usize::from(input.index);
    let count = usize::from(input.count);
    let (start, end) = (usize::from(input.selection.0), usize::from(input.selection.1));

    let control = Control {
        value: RefCell::new(input.current.clone()),
        selection: Cell::new(Selection::new(start.min(end), start.max(end))),
        focused: input.focused,
        scroll: Cell::new(17),
    };

    let provenance = if input.remove {
        Provenance::StringRemove {
            previous: input.previous.clone(),
            index,
            count,
        }
    } else {
        Provenance::StringInsert {
            previous: input.previous.clone(),
            index,
            text: input.text.clone(),
        }
    };

    let outcome = apply(&control, Some(&provenance), input.patching);
    let value = control.value();
    let len = char_len(&value);

    match outcome {
        PatchOutcome::Fallback => {
            assert!(!input.patching);
            assert_eq!(value, input.current);
        }
        PatchOutcome::AlreadyCurrent => assert_eq!(value, input.current),
        PatchOutcome::Inserted => {
            assert!(!input.remove);
            assert_eq!(len, char_len(&input.current) + char_len(&input.text));
            assert_eq!(value, splice_insert(&input.current, index, &input.text));
        }
        PatchOutcome::Removed => {
            assert!(input.remove);
            assert!(len <= char_len(&input.current));
            assert_eq!(value, splice_remove(&input.current, index, count));
        }
        PatchOutcome::SkippedLocal => unreachable!("no local provenance was generated"),
    }

    let selection = control.selection();
    assert!(selection.start <= selection.end, "selection stays ordered");
    assert!(selection.end <= len.max(start.max(end)), "selection stays in bounds");
    if matches!(outcome, PatchOutcome::Inserted | PatchOutcome::Removed) {
        assert!(selection.end <= len);
        assert_eq!(control.scroll_top(), 17, "scroll position is kept");
    }
});
