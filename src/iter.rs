//! The safe traversal protocol.
//!
//! The iterator walks hand over hand: the link in front of the cursor stays
//! owned while the cursor advances, so the element the iterator stands on
//! can never be unlinked under it by another thread. Acquiring the next
//! element means owning its forward link too; the element is then isolated,
//! with both of its own fields locked and each neighbor locked on the side
//! facing it, while the rest of the list stays fully operable. Only the
//! current acquisition ever rolls back; elements already visited are
//! committed and stay committed.

use core::ptr::NonNull;

use scopeguard::{guard, ScopeGuard};

use crate::backoff::Backoff;
use crate::list::{addr, node, Ends, MtList};
use crate::lock::{Claims, Contended};

/// What to do with the element just yielded by
/// [`for_each`](MtList::for_each).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep the element and move to the next one.
    Continue,
    /// Unlink the element, leave it detached, and move on.
    Remove,
    /// Keep the element and stop the traversal.
    Break,
    /// Unlink the element, leave it detached, and stop the traversal.
    RemoveBreak,
}

impl MtList {
    /// Visits every element of the list exactly once, front to back.
    ///
    /// Each element is yielded isolated: both of its link fields are locked
    /// for the duration of the body, as are the two neighbor fields facing
    /// it, so no other thread can unlink or relink it meanwhile. The body
    /// decides the element's fate through the returned [`Step`]; removal
    /// this way is the supported form of deletion during traversal. If the
    /// body panics, the element is reinstalled before the panic propagates
    /// and no lock is leaked.
    ///
    /// Other threads may operate on the untouched parts of the list
    /// concurrently, including running their own traversal. The body
    /// however must not perform operations on this list itself (including
    /// `delete` of the yielded element; use [`Step::Remove`]): those would
    /// wait forever on the locks the iterator already holds. Operations on
    /// other lists are fine.
    ///
    /// # Safety
    ///
    /// `self` must be an initialized, valid list head, and every element
    /// must stay valid and in place for the duration of the traversal.
    ///
    /// # Examples
    ///
    /// ```
    /// use mt_list::{MtList, Step};
    ///
    /// let head = Box::new(MtList::new());
    /// head.init();
    /// let a = Box::new(MtList::new());
    /// a.init();
    /// let b = Box::new(MtList::new());
    /// b.init();
    ///
    /// unsafe {
    ///     head.append(&a);
    ///     head.append(&b);
    ///
    ///     // Drop every element while walking.
    ///     let mut seen = 0;
    ///     head.for_each(|_| {
    ///         seen += 1;
    ///         Step::Remove
    ///     });
    ///     assert_eq!(seen, 2);
    ///     assert!(head.is_empty());
    /// }
    /// ```
    #[cfg_attr(not(feature = "noinline"), inline)]
    #[cfg_attr(feature = "noinline", inline(never))]
    pub unsafe fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(NonNull<MtList>) -> Step,
    {
        let head = addr(self);
        // The carried pair: the owned link between the cursor position and
        // the candidate in front of it.
        let mut ends = self.cut_after();
        loop {
            let pos = ends.prev_addr();
            let cur = ends.next_addr();
            if cur == head {
                // Wrapped around; reseal the link behind us.
                ends.connect();
                return;
            }

            // Isolate the candidate by owning its forward link as well.
            let succ = {
                let mut backoff = Backoff::new();
                loop {
                    match step_lock(cur) {
                        Ok(succ) => break succ,
                        Err(Contended) => backoff.spin(),
                    }
                }
            };

            // Run the body. Should it unwind, the element goes back in
            // place first so the panic does not wedge the list.
            let reinstall = guard((pos, cur, succ), |(pos, cur, succ)| unsafe {
                relink(pos, cur, succ);
            });
            let step = f(NonNull::new_unchecked(cur as *mut MtList));
            let (pos, cur, succ) = ScopeGuard::into_inner(reinstall);

            match step {
                Step::Continue => {
                    // Release the pair behind the element and carry the one
                    // in front of it forward.
                    node(cur).prev.unlock(pos);
                    node(pos).next.unlock(cur);
                    ends = Ends::new(cur, succ);
                }
                Step::Remove => {
                    // Detach the element; the bridge from `pos` to `succ`
                    // stays owned and becomes the carried pair.
                    node(cur).next.unlock(cur);
                    node(cur).prev.unlock(cur);
                    ends = Ends::new(pos, succ);
                }
                Step::Break => {
                    relink(pos, cur, succ);
                    return;
                }
                Step::RemoveBreak => {
                    node(cur).next.unlock(cur);
                    node(cur).prev.unlock(cur);
                    Ends::new(pos, succ).connect();
                    return;
                }
            }
        }
    }
}

/// Owns the forward link of `cur`: its `next` field and the successor's
/// backward field. `cur.prev` and the link behind it already belong to the
/// iterator, so a failure only rolls back this acquisition.
unsafe fn step_lock(cur: usize) -> Result<usize, Contended> {
    let mut claims = Claims::new();
    let succ = claims.lock(&node(cur).next)?;
    let back = claims.lock(&node(succ).prev)?;
    debug_assert_eq!(back, cur);
    claims.commit();
    Ok(succ)
}

/// Reinstalls `cur` between `pos` and `succ`, releasing all four owned
/// fields.
unsafe fn relink(pos: usize, cur: usize, succ: usize) {
    let el = node(cur);
    el.prev.unlock(pos);
    el.next.unlock(succ);
    node(succ).prev.unlock(cur);
    node(pos).next.unlock(cur);
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;
    use std::collections::HashSet;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::vec;
    use std::vec::Vec;

    use crossbeam_utils::thread;

    use super::Step;
    use crate::list::{node, MtList};

    fn new_node() -> Box<MtList> {
        let el = Box::new(MtList::new());
        el.init();
        el
    }

    fn addr_of(el: &MtList) -> usize {
        el as *const MtList as usize
    }

    fn walk_next(head: &MtList) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = head.next.peek();
        while cur != addr_of(head) {
            out.push(cur);
            cur = unsafe { node(cur) }.next.peek();
        }
        out
    }

    fn collect(head: &MtList) -> Vec<usize> {
        let mut seen = Vec::new();
        unsafe {
            head.for_each(|el| {
                seen.push(el.as_ptr() as usize);
                Step::Continue
            });
        }
        seen
    }

    #[test]
    fn visits_in_order_and_leaves_the_list_intact() {
        let head = new_node();
        let (a, b, c) = (new_node(), new_node(), new_node());
        unsafe {
            head.append(&a);
            head.append(&b);
            head.append(&c);
        }
        let expected = vec![addr_of(&a), addr_of(&b), addr_of(&c)];
        assert_eq!(collect(&head), expected);
        assert_eq!(walk_next(&head), expected);
    }

    #[test]
    fn empty_list_never_runs_the_body() {
        let head = new_node();
        assert_eq!(collect(&head), vec![]);
        assert!(head.is_empty());
    }

    #[test]
    fn remove_unlinks_the_yielded_element() {
        let head = new_node();
        let (a, b, c) = (new_node(), new_node(), new_node());
        unsafe {
            head.append(&a);
            head.append(&b);
            head.append(&c);
            head.for_each(|el| {
                if el.as_ptr() as usize == addr_of(&b) {
                    Step::Remove
                } else {
                    Step::Continue
                }
            });
        }
        assert_eq!(walk_next(&head), vec![addr_of(&a), addr_of(&c)]);
        assert!(!b.in_list());
        assert_eq!(b.next.peek(), addr_of(&b));
        assert_eq!(b.prev.peek(), addr_of(&b));
    }

    #[test]
    fn remove_everything_empties_the_list() {
        let head = new_node();
        let nodes: Vec<Box<MtList>> = (0..5).map(|_| new_node()).collect();
        unsafe {
            for el in &nodes {
                head.append(el);
            }
            head.for_each(|_| Step::Remove);
        }
        assert!(head.is_empty());
        for el in &nodes {
            assert!(!el.in_list());
        }
    }

    #[test]
    fn break_stops_early_and_reinstalls() {
        let head = new_node();
        let (a, b) = (new_node(), new_node());
        unsafe {
            head.append(&a);
            head.append(&b);
        }
        let mut seen = 0;
        unsafe {
            head.for_each(|_| {
                seen += 1;
                Step::Break
            });
        }
        assert_eq!(seen, 1);
        assert_eq!(walk_next(&head), vec![addr_of(&a), addr_of(&b)]);
    }

    #[test]
    fn remove_break_unlinks_then_stops() {
        let head = new_node();
        let (a, b, c) = (new_node(), new_node(), new_node());
        unsafe {
            head.append(&a);
            head.append(&b);
            head.append(&c);
            head.for_each(|_| Step::RemoveBreak);
        }
        assert_eq!(walk_next(&head), vec![addr_of(&b), addr_of(&c)]);
        assert!(!a.in_list());
    }

    #[test]
    fn panicking_body_reinstalls_and_releases_locks() {
        let head = new_node();
        let (a, b) = (new_node(), new_node());
        unsafe {
            head.append(&a);
            head.append(&b);
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| unsafe {
            head.for_each(|_| panic!("body gave up"));
        }));
        assert!(outcome.is_err());
        assert_eq!(walk_next(&head), vec![addr_of(&a), addr_of(&b)]);

        // No lock leaked: mutation still goes through.
        assert!(unsafe { a.delete() });
        assert_eq!(walk_next(&head), vec![addr_of(&b)]);
    }

    #[test]
    fn concurrent_traversal_with_a_mutator() {
        const VOLATILE: usize = 8;
        const ROUNDS: usize = 200;

        let head = new_node();
        let stable: Vec<Box<MtList>> = (0..8).map(|_| new_node()).collect();
        let volatile: Vec<Box<MtList>> = (0..VOLATILE).map(|_| new_node()).collect();
        for el in &stable {
            unsafe {
                head.append(el);
            }
        }
        let stable_set: HashSet<usize> = stable.iter().map(|el| addr_of(el)).collect();

        thread::scope(|s| {
            let head = &*head;
            let volatile = &volatile;
            let stable_set = &stable_set;

            s.spawn(move |_| {
                for _ in 0..ROUNDS {
                    for el in volatile {
                        unsafe {
                            head.append(el);
                        }
                    }
                    for el in volatile {
                        assert!(unsafe { el.delete() });
                    }
                }
            });

            for _ in 0..2 {
                s.spawn(move |_| {
                    for _ in 0..ROUNDS {
                        let mut stable_seen = 0;
                        unsafe {
                            head.for_each(|el| {
                                if stable_set.contains(&(el.as_ptr() as usize)) {
                                    stable_seen += 1;
                                }
                                Step::Continue
                            });
                        }
                        // Elements present for the whole pass show up
                        // exactly once each.
                        assert_eq!(stable_seen, stable_set.len());
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(walk_next(&head).len(), stable.len());
    }

    #[test]
    fn removal_during_concurrent_traversal() {
        const ELEMENTS: usize = 64;

        let head = new_node();
        let nodes: Vec<Box<MtList>> = (0..ELEMENTS).map(|_| new_node()).collect();
        unsafe {
            for el in &nodes {
                head.append(el);
            }
        }

        // Two threads sweep the same list, each removing its own half.
        thread::scope(|s| {
            let head = &*head;
            let nodes = &nodes;
            for parity in 0..2usize {
                s.spawn(move |_| {
                    let mine: HashSet<usize> = nodes
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| i % 2 == parity)
                        .map(|(_, el)| addr_of(el))
                        .collect();
                    unsafe {
                        head.for_each(|el| {
                            if mine.contains(&(el.as_ptr() as usize)) {
                                Step::Remove
                            } else {
                                Step::Continue
                            }
                        });
                    }
                });
            }
        })
        .unwrap();

        assert!(head.is_empty());
        for el in &nodes {
            assert!(!el.in_list());
        }
    }
}
