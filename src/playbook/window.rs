//! Bounded FIFO of recent reflections (the curator's "guidebook").

use std::collections::VecDeque;

use crate::roles::Reflection;

/// Holds at most `capacity` reflections, evicting the oldest on overflow.
#[derive(Debug, Clone)]
pub struct ReflectionWindow {
    entries: VecDeque<Reflection>,
    capacity: usize,
}

impl ReflectionWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a reflection, returning the evicted one if the window was full.
    ///
    /// With capacity 0 the reflection itself is returned.
    pub fn push(&mut self, reflection: Reflection) -> Option<Reflection> {
        if self.capacity == 0 {
            return Some(reflection);
        }
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(reflection);
        evicted
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Reflection> {
        self.entries.iter()
    }

    /// Render the window as curator context, oldest first.
    pub fn as_guidebook(&self) -> String {
        if self.entries.is_empty() {
            return "(no previous reflections)".to_string();
        }
        self.entries
            .iter()
            .enumerate()
            .map(|(i, r)| format!("### Reflection {}\n{}", i + 1, r.summary()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
