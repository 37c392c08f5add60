//! Fuzz target for the reordering window
//!
//! # Strategy
//!
//! - Stream numbers: inside the window, at its edges, far above, near
//!   `u32::MAX`
//! - Persistence: round trip the window through its state at random points
//!
//! # Invariants
//!
//! - A number is accepted at most once
//! - Accepted numbers stay seen; out-of-window numbers are rejected
//!   without changing the window
//! - `added` and `removed` report exactly the change in the unseen set
//! - The window never slides backwards
//! - Restoring from `state()` yields an identical window

#![no_main]

use std::collections::BTreeSet;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tagwire_core::{ReorderingWindow, WindowError};

#[derive(Debug, Clone, Arbitrary)]
enum WindowOp {
    SetSeen(StreamChoice),
    Restore,
}

#[derive(Debug, Clone, Arbitrary)]
enum StreamChoice {
    /// Offset from the current bottom
    InWindow(u8),
    AboveTop(u16),
    NearMax(u8),
    Random(u32),
}

fn pick(window: &ReorderingWindow, choice: &StreamChoice) -> u32 {
    let bottom = window.bottom();
    let raw = match choice {
        StreamChoice::InWindow(offset) => bottom + u64::from(*offset % 32),
        StreamChoice::AboveTop(offset) => window.top() + 1 + u64::from(*offset),
        StreamChoice::NearMax(offset) => u64::from(u32::MAX - u32::from(*offset)),
        StreamChoice::Random(n) => u64::from(*n),
    };
    u32::try_from(raw).unwrap_or(u32::MAX)
}

fuzz_target!(|ops: Vec<WindowOp>| {
    let mut window = ReorderingWindow::new();
    let mut accepted: BTreeSet<u32> = BTreeSet::new();

    for op in ops {
        match op {
            WindowOp::SetSeen(choice) => {
                let stream = pick(&window, &choice);
                let before = window.clone();
                let unseen_before: BTreeSet<u32> = window.unseen().collect();

                match window.set_seen(stream) {
                    Ok(change) => {
                        assert!(accepted.insert(stream), "stream {stream} accepted twice");
                        assert!(window.centre() >= before.centre());

                        let unseen_after: BTreeSet<u32> = window.unseen().collect();
                        let added: BTreeSet<u32> =
                            unseen_after.difference(&unseen_before).copied().collect();
                        let mut removed: BTreeSet<u32> =
                            unseen_before.difference(&unseen_after).copied().collect();
                        removed.remove(&stream);

                        assert_eq!(change.added.iter().copied().collect::<BTreeSet<_>>(), added);
                        assert_eq!(
                            change.removed.iter().copied().collect::<BTreeSet<_>>(),
                            removed
                        );
                    },
                    Err(WindowError::AlreadySeen { .. }) => {
                        assert_eq!(window, before);
                        assert!(!unseen_before.contains(&stream));
                    },
                    Err(WindowError::OutOfWindow { bottom, top, .. }) => {
                        assert_eq!(window, before);
                        let n = u64::from(stream);
                        assert!(n < bottom || n > top);
                    },
                }

                for stream in &accepted {
                    assert!(window.is_seen(*stream), "accepted stream {stream} became unseen");
                }
            },
            WindowOp::Restore => {
                let restored = ReorderingWindow::from_state(window.state());
                assert_eq!(restored, window);
                window = restored;
            },
        }
    }
});
