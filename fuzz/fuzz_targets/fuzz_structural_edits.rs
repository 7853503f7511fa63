#![no_main]

use std::rc::Rc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use strand_core::Path;
use strand_runtime::{BindingRegistry, Context, EventModel, HelperTable};

#[derive(Arbitrary, Debug)]
enum Op {
    Insert { index: u8, count: u8 },
    Remove { index: u8, count: u8 },
    Move { from: u8, to: u8, count: u8 },
}

#[derive(Arbitrary, Debug)]
struct Input {
    initial: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let initial = usize::from(input.initial % 32);
    let list = Path::parse("items").expect("static path");
    let mut model = EventModel::new();
    let mut registry = BindingRegistry::new(true);
    let root = Context::new(Rc::new(HelperTable::new()));

    // The list as the store would hold it: each slot carries the tag of the
    // context created for it, or `None` for later inserts.
    let mut items: Vec<Option<usize>> = (0..initial).map(Some).collect();
    let contexts: Vec<_> = (0..initial)
        .map(|i| registry.add_item_context_at(&mut model, &root, list.child(i), None))
        .collect();

    for op in input.ops.iter().take(64) {
        let dispatch = match *op {
            Op::Insert { index, count } => {
                let index = usize::from(index).min(items.len());
                let count = usize::from(count % 8);
                items.splice(index..index, std::iter::repeat_n(None, count));
                model.insert(&list, index, count)
            }
            Op::Remove { index, count } => {
                let start = usize::from(index).min(items.len());
                let end = start.saturating_add(usize::from(count % 8)).min(items.len());
                items.drain(start..end);
                model.remove(&list, start, end - start)
            }
            Op::Move { from, to, count } => {
                let start = usize::from(from).min(items.len());
                let end = start.saturating_add(usize::from(count % 8)).min(items.len());
                let moved: Vec<_> = items.drain(start..end).collect();
                let at = usize::from(to).min(items.len());
                let count = moved.len();
                items.splice(at..at, moved);
                model.move_items(&list, start, at, count)
            }
        };
        registry.evict(&dispatch.evicted);
    }

    for (tag, item) in contexts.iter().enumerate() {
        if item.is_live() {
            let index = item.index().expect("item context ends in an index");
            assert_eq!(items.get(index), Some(&Some(tag)), "context {tag} drifted");
        } else {
            assert!(!items.contains(&Some(tag)), "context {tag} evicted but present");
        }
    }
    let live = contexts.iter().filter(|c| c.is_live()).count();
    assert_eq!(live, registry.context_count());
    assert_eq!(live, model.context_count());
});
