//! Multi-thread aware doubly-linked circular lists.
//!
//! Many threads may concurrently insert, append, remove, pop, behead, and
//! iterate over a shared list. Instead of a single lock around the list,
//! every direction of every link can be owned individually by atomically
//! swapping a `BUSY` sentinel into the link word itself, so operations on
//! distant parts of a list do not contend at all.
//!
//! # Nodes and lists
//!
//! [`MtList`] is both the element type and the head type: a pair of atomic
//! link words meant to be embedded into a caller-owned structure. A list is
//! a circular chain of nodes; an empty head, and equally a detached
//! element, points to itself in both directions. [`mt_list_entry!`]
//! recovers the enclosing structure from a node address.
//!
//! # Locking protocol
//!
//! The link between two adjacent nodes `A` and `B` is made of two fields,
//! `A.next` and `B.prev`. A thread owns a field once an atomic exchange of
//! the `BUSY` sentinel returned a non-`BUSY` prior value, and must own both
//! fields of every link it intends to change. When any acquisition fails,
//! the operation restores whatever it had acquired, pauses with exponential
//! backoff, and starts over from scratch, so two conflicting threads cannot
//! block each other for long. Every operation returns only once the list is
//! consistent again.
//!
//! The cut and connect operations expose the middle of this protocol: they
//! leave a link, or a whole element, owned and hand back an [`Ends`] token
//! that later reconnects the two sides.
//!
//! # Ownership
//!
//! The crate never allocates or frees anything. Callers own node storage
//! and must keep a node alive, in place, and exclusively managed through
//! this protocol for as long as any list links to it. That contract cannot
//! be checked here, which is why the linking operations are `unsafe`.
//! Reclaiming the storage of a removed node is equally the caller's
//! problem: another thread may still be spinning on it until its own
//! operation completes, so free it only once that cannot be the case
//! anymore (quiescence, epochs, or similar).
//!
//! # Examples
//!
//! ```
//! use mt_list::MtList;
//!
//! let head = Box::new(MtList::new());
//! head.init();
//! let a = Box::new(MtList::new());
//! a.init();
//!
//! unsafe {
//!     head.append(&a);
//!     assert!(!head.is_empty());
//!     assert_eq!(head.pop(), Some((&*a).into()));
//!     assert_eq!(head.pop(), None);
//! }
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

mod backoff;
mod iter;
mod link;
mod list;
mod lock;

pub use self::iter::Step;
pub use self::list::{Ends, MtList};

#[doc(hidden)]
pub mod __private {
    pub use memoffset::offset_of;
}

/// Recovers the structure enclosing a list node.
///
/// `$node` is a `*mut MtList` pointing at the `$member` field of a
/// `$container`; the expansion is a `*mut $container`. The conversion is a
/// compile-time field-offset subtraction and round-trips with the
/// embedding, but dereferencing the result is only sound if `$node` really
/// is embedded that way, hence the expansion must sit in `unsafe` code.
///
/// # Examples
///
/// ```
/// use mt_list::{mt_list_entry, MtList};
///
/// struct Job {
///     id: u32,
///     queue: MtList,
/// }
///
/// let job = Box::new(Job { id: 7, queue: MtList::new() });
/// job.queue.init();
///
/// let node = core::ptr::NonNull::from(&job.queue);
/// let back = unsafe { &*mt_list_entry!(node.as_ptr(), Job, queue) };
/// assert_eq!(back.id, 7);
/// ```
#[macro_export]
macro_rules! mt_list_entry {
    ($node:expr, $container:path, $member:ident) => {{
        let __node: *mut $crate::MtList = $node;
        __node
            .cast::<u8>()
            .sub($crate::__private::offset_of!($container, $member))
            .cast::<$container>()
    }};
}
