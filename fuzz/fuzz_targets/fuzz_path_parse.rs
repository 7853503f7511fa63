#![no_main]

use libfuzzer_sys::fuzz_target;
use strand_core::{Path, PathError, Segment};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    match Path::parse(input) {
        Ok(path) => {
            // Display is the inverse of parse.
            let printed = path.to_string();
            assert_eq!(printed, input, "display must reproduce the input");
            let reparsed = Path::parse(&printed).expect("printed path must parse");
            assert_eq!(reparsed, path, "parse(display(p)) must equal p");

            let tokens = if input.is_empty() { 0 } else { input.split('.').count() };
            assert_eq!(path.len(), tokens);
            for segment in path.iter() {
                if let Segment::Key(key) = segment {
                    assert!(!key.is_empty());
                    assert!(!key.contains('.'));
                }
            }

            if let Some(parent) = path.parent() {
                assert!(path.starts_with(&parent));
                assert_eq!(parent.len() + 1, path.len());
            }
            if path.is_concrete() {
                assert!(path.overlaps(&path), "a concrete path overlaps itself");
            }
        }
        Err(PathError::EmptySegment { position, .. }) => {
            let tokens: Vec<&str> = input.split('.').collect();
            assert!(position < tokens.len());
            assert!(tokens[position].is_empty());
        }
    }
});
