//! Round-robin state owned by a dispatcher's control loop.

use crate::target::ResolvedTargetSet;

/// Current targets plus the round-robin cursor.
///
/// Never shared: each dispatcher owns one and mutates it from its own loop.
#[derive(Debug, Default)]
pub struct DispatchState {
    targets: ResolvedTargetSet,
    cursor: usize,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the target set wholesale. The cursor is left alone.
    pub fn replace_targets(&mut self, targets: ResolvedTargetSet) {
        self.targets = targets;
    }

    /// Pick `cursor mod len` and advance the cursor.
    ///
    /// Returns `None` without advancing when there is no target.
    pub fn next_target(&mut self) -> Option<String> {
        let selected = self.targets.select(self.cursor)?.to_string();
        self.cursor = self.cursor.wrapping_add(1);
        Some(selected)
    }

    pub fn targets(&self) -> &ResolvedTargetSet {
        &self.targets
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}
