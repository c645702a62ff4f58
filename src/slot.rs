// Copyright 2024 All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The single "current tunnel" cell.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Something that must be told when it stops being current.
pub trait Retire {
    /// Called once, after the value has been replaced.
    fn retire(&self);
}

/// Holds at most one value that many tasks read and occasionally
/// replace, without locks.
///
/// Replacing the value retires the value it displaced. Since the swap
/// hands back exactly the previous occupant, two racing stores can
/// never retire the same value and a value is never retired while it
/// is still the one [`Slot::load`] returns.
#[derive(Debug)]
pub struct Slot<T> {
    /// The current occupant.
    current: ArcSwapOption<T>,
}

impl<T> Default for Slot<T> {
    #[inline]
    fn default() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }
}

impl<T: Retire> Slot<T> {
    /// Create an empty slot.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `next` current and retire the value it displaced, which is
    /// also returned.
    #[inline]
    pub fn store(&self, next: Arc<T>) -> Option<Arc<T>> {
        let previous = self.current.swap(Some(next));
        if let Some(previous) = &previous {
            previous.retire();
        }
        previous
    }

    /// The current value, if any.
    #[inline]
    pub fn load(&self) -> Option<Arc<T>> {
        self.current.load_full()
    }

    /// Empty the slot, but only while `occupant` is still current.
    /// Returns whether it was removed. Nothing is retired.
    #[inline]
    pub fn clear_if(&self, occupant: &Arc<T>) -> bool {
        let previous = self.current.compare_and_swap(occupant, None::<Arc<T>>);
        Option::as_ref(&previous).is_some_and(|previous| Arc::ptr_eq(previous, occupant))
    }

    /// Empty the slot and retire whatever was in it.
    #[inline]
    pub fn retire_current(&self) -> Option<Arc<T>> {
        let previous = self.current.swap(None);
        if let Some(previous) = &previous {
            previous.retire();
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct Counted {
        retired: AtomicUsize,
    }

    impl Retire for Counted {
        fn retire(&self) {
            self.retired.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Counted {
        fn retirements(&self) -> usize {
            self.retired.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn empty_slot_loads_nothing() {
        let slot = Slot::<Counted>::new();
        assert!(slot.load().is_none());
    }

    #[test]
    fn sequential_stores_retire_each_predecessor_once() {
        let slot = Slot::new();
        let values: Vec<Arc<Counted>> = (0..8).map(|_| Arc::default()).collect();
        for value in &values {
            slot.store(Arc::clone(value));
        }

        let (last, earlier) = values.split_last().unwrap();
        assert!(Arc::ptr_eq(&slot.load().unwrap(), last));
        assert_eq!(last.retirements(), 0);
        for value in earlier {
            assert_eq!(value.retirements(), 1);
        }
    }

    #[test]
    fn store_returns_displaced_value() {
        let slot = Slot::new();
        let first = Arc::new(Counted::default());
        assert!(slot.store(Arc::clone(&first)).is_none());
        let displaced = slot.store(Arc::default()).unwrap();
        assert!(Arc::ptr_eq(&displaced, &first));
    }

    #[test]
    fn concurrent_stores_never_leave_a_retired_value_current() {
        let slot = Slot::new();
        let values: Vec<Arc<Counted>> = (0..64).map(|_| Arc::default()).collect();

        std::thread::scope(|scope| {
            for chunk in values.chunks(8) {
                let slot = &slot;
                scope.spawn(move || {
                    for value in chunk {
                        slot.store(Arc::clone(value));
                        let _ = slot.load();
                    }
                });
            }
        });

        let current = slot.load().unwrap();
        assert_eq!(current.retirements(), 0);
        let mut current_seen = 0;
        for value in &values {
            if Arc::ptr_eq(value, &current) {
                current_seen += 1;
            } else {
                assert_eq!(value.retirements(), 1);
            }
        }
        assert_eq!(current_seen, 1);
    }

    #[test]
    fn clear_if_only_removes_the_named_occupant() {
        let slot = Slot::new();
        let old = Arc::new(Counted::default());
        let new = Arc::new(Counted::default());
        slot.store(Arc::clone(&old));
        slot.store(Arc::clone(&new));

        assert!(!slot.clear_if(&old));
        assert!(Arc::ptr_eq(&slot.load().unwrap(), &new));

        assert!(slot.clear_if(&new));
        assert!(slot.load().is_none());
        assert_eq!(new.retirements(), 0);
    }

    #[test]
    fn retire_current_empties_and_retires() {
        let slot = Slot::new();
        let value = Arc::new(Counted::default());
        slot.store(Arc::clone(&value));

        assert!(slot.retire_current().is_some());
        assert!(slot.load().is_none());
        assert_eq!(value.retirements(), 1);
        assert!(slot.retire_current().is_none());
    }
}
