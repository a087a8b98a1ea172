//! The node type and the operation layer.

use core::fmt;
use core::ptr::NonNull;

use crate::backoff::Backoff;
use crate::link::{Link, BUSY};
use crate::lock::{Claims, Contended};

/// An element of a multi-thread aware doubly-linked circular list.
///
/// A node is two atomic link words and nothing else. Any node may serve as
/// the head of a list; an empty head is simply a node linked to itself in
/// both directions, which is also what a detached element looks like.
///
/// Nodes are address-identified: construction with [`new`](MtList::new)
/// leaves the links null, and [`init`](MtList::init) must run once the node
/// sits at its final address. A node must not move, be re-initialized, or be
/// dropped while any list links to it.
pub struct MtList {
    pub(crate) next: Link,
    pub(crate) prev: Link,
}

/// The address a node is identified by inside link fields.
#[inline]
pub(crate) fn addr(el: &MtList) -> usize {
    el as *const MtList as usize
}

/// Reborrows the node behind a link value.
#[inline]
pub(crate) unsafe fn node<'a>(a: usize) -> &'a MtList {
    &*(a as *const MtList)
}

/// Where an element lands relative to its anchor.
enum Place {
    After,
    Before,
}

impl MtList {
    /// Returns a node with null links. Call [`init`](MtList::init) before
    /// any other operation, once the node has its final address.
    pub const fn new() -> Self {
        MtList {
            next: Link::null(),
            prev: Link::null(),
        }
    }

    /// Links the node to itself in both directions, making it an empty list
    /// head (equivalently, a detached element).
    ///
    /// Must only be used on a node that no list currently links to;
    /// re-initializing a linked node corrupts its list.
    pub fn init(&self) {
        let me = addr(self);
        self.next.unlock(me);
        self.prev.unlock(me);
    }

    /// Whether the list headed by this node is empty.
    ///
    /// A momentary snapshot: under concurrent mutation the answer may be
    /// stale by the time it is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use mt_list::MtList;
    ///
    /// let head = Box::new(MtList::new());
    /// head.init();
    /// assert!(head.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.next.peek() == addr(self)
    }

    /// Whether this node is currently linked into a list. The complement of
    /// [`is_empty`](MtList::is_empty), read from the element's point of
    /// view, and just as momentary.
    pub fn in_list(&self) -> bool {
        !self.is_empty()
    }

    /// Reads the forward link, `None` for the null terminator of a chain
    /// returned by [`behead`](MtList::behead).
    ///
    /// Only meaningful on a beheaded chain or on a list that no other thread
    /// is operating on; a live link may hold the lock sentinel, which this
    /// accessor must never observe.
    pub fn next_node(&self) -> Option<NonNull<MtList>> {
        let a = self.next.peek();
        debug_assert_ne!(a, BUSY);
        NonNull::new(a as *mut MtList)
    }

    /// Adds `el` immediately before this node, so before the head this
    /// means at the tail of the list. `el`'s prior link contents are
    /// overwritten.
    ///
    /// # Safety
    ///
    /// The caller must own `el` exclusively and `el` must not belong to any
    /// list. Both nodes must be initialized and stay valid and in place
    /// while linked.
    pub unsafe fn append(&self, el: &MtList) {
        el.connect_elem(self.cut_before());
    }

    /// Adds `el` immediately after this node, so after the head this means
    /// at the front of the list. `el`'s prior link contents are overwritten.
    ///
    /// # Safety
    ///
    /// Same contract as [`append`](MtList::append).
    pub unsafe fn insert(&self, el: &MtList) {
        el.connect_elem(self.cut_after());
    }

    /// Like [`append`](MtList::append), but only succeeds if `el` is
    /// detached at that moment, making it safe for elements whose membership
    /// is not known. Returns whether `el` was linked in; on `false` neither
    /// list changed.
    ///
    /// # Safety
    ///
    /// Both nodes must be initialized, valid, in place, and managed through
    /// this protocol. Unlike [`append`](MtList::append), `el` may be shared
    /// with other threads.
    #[cfg_attr(not(feature = "noinline"), inline)]
    #[cfg_attr(feature = "noinline", inline(never))]
    #[must_use]
    pub unsafe fn try_append(&self, el: &MtList) -> bool {
        let mut backoff = Backoff::new();
        loop {
            match try_splice_attempt(self, el, Place::Before) {
                Ok(done) => return done,
                Err(Contended) => backoff.spin(),
            }
        }
    }

    /// Like [`insert`](MtList::insert), but only succeeds if `el` is
    /// detached at that moment. Returns whether `el` was linked in.
    ///
    /// # Safety
    ///
    /// Same contract as [`try_append`](MtList::try_append).
    #[cfg_attr(not(feature = "noinline"), inline)]
    #[cfg_attr(feature = "noinline", inline(never))]
    #[must_use]
    pub unsafe fn try_insert(&self, el: &MtList) -> bool {
        let mut backoff = Backoff::new();
        loop {
            match try_splice_attempt(self, el, Place::After) {
                Ok(done) => return done,
                Err(Contended) => backoff.spin(),
            }
        }
    }

    /// Removes this node from whatever list it is in and leaves it
    /// detached. Returns `false`, without mutating anything, if the node
    /// was already detached.
    ///
    /// Owns all four surrounding fields before committing: the two fields
    /// of the link into the node, and the two fields of the link out of it.
    ///
    /// # Safety
    ///
    /// The node must be initialized, valid, in place, and part of a
    /// well-formed list (or detached).
    pub unsafe fn delete(&self) -> bool {
        let ends = self.cut_around();
        let linked = ends.next_addr() != addr(self);
        ends.connect();
        if linked {
            self.unlock_self();
        }
        linked
    }

    /// Unlinks and returns the first element of the list, `None` if the
    /// list was empty.
    ///
    /// # Safety
    ///
    /// `self` must be an initialized, valid list head. The returned node is
    /// detached and exclusively the caller's until linked again.
    ///
    /// # Examples
    ///
    /// ```
    /// use mt_list::MtList;
    ///
    /// let head = Box::new(MtList::new());
    /// head.init();
    /// let el = Box::new(MtList::new());
    /// el.init();
    ///
    /// unsafe {
    ///     head.append(&el);
    ///     assert_eq!(head.pop(), Some((&*el).into()));
    ///     assert_eq!(head.pop(), None);
    /// }
    /// ```
    #[cfg_attr(not(feature = "noinline"), inline)]
    #[cfg_attr(feature = "noinline", inline(never))]
    pub unsafe fn pop(&self) -> Option<NonNull<MtList>> {
        let mut backoff = Backoff::new();
        loop {
            match pop_attempt(self) {
                Ok(first) => return first,
                Err(Contended) => backoff.spin(),
            }
        }
    }

    /// Detaches the whole chain from the head in constant time, returning
    /// the first element or `None` if the list was empty.
    ///
    /// The detached chain is not a list anymore: it is open, with the last
    /// element's forward link null and the first element's backward link
    /// still naming the last. Walk it with
    /// [`next_node`](MtList::next_node) until `None` and treat each node
    /// individually (they still believe they are linked).
    ///
    /// Beheading only owns the two links around the head, so it can run
    /// concurrently with insertions and appends at the same head, but not
    /// with `delete` or `pop` elsewhere in the list: those may still be
    /// mid-flight inside the chain being carried away, and a walker of the
    /// returned chain could then meet a locked link.
    ///
    /// # Safety
    ///
    /// `self` must be an initialized, valid list head, and no concurrent
    /// removal may target an element of this list, per the above.
    #[cfg_attr(not(feature = "noinline"), inline)]
    #[cfg_attr(feature = "noinline", inline(never))]
    pub unsafe fn behead(&self) -> Option<NonNull<MtList>> {
        let mut backoff = Backoff::new();
        loop {
            match behead_attempt(self) {
                Ok(first) => return first,
                Err(Contended) => backoff.spin(),
            }
        }
    }

    /// Owns the link between this node and its successor, leaving both of
    /// its fields locked, and returns the token that reconnects them.
    ///
    /// # Safety
    ///
    /// The node must be initialized, valid, in place, and part of a
    /// well-formed list (or detached, in which case the token captures the
    /// node on both sides). The token must eventually be fed back to
    /// [`Ends::connect`] or [`connect_elem`](MtList::connect_elem);
    /// dropping it leaves the link locked forever.
    #[cfg_attr(not(feature = "noinline"), inline)]
    #[cfg_attr(feature = "noinline", inline(never))]
    pub unsafe fn cut_after(&self) -> Ends {
        let mut backoff = Backoff::new();
        loop {
            match lock_next_attempt(self) {
                Ok(ends) => return ends,
                Err(Contended) => backoff.spin(),
            }
        }
    }

    /// Owns the link between this node's predecessor and this node.
    /// Symmetric to [`cut_after`](MtList::cut_after).
    ///
    /// # Safety
    ///
    /// Same contract as [`cut_after`](MtList::cut_after).
    #[cfg_attr(not(feature = "noinline"), inline)]
    #[cfg_attr(feature = "noinline", inline(never))]
    pub unsafe fn cut_before(&self) -> Ends {
        let mut backoff = Backoff::new();
        loop {
            match lock_prev_attempt(self) {
                Ok(ends) => return ends,
                Err(Contended) => backoff.spin(),
            }
        }
    }

    /// Owns both links surrounding this node. On return the node is fully
    /// isolated with its own fields locked too, and the token captures its
    /// two neighbors, the endpoints of the bridging link that would remain
    /// if the node went away.
    ///
    /// Follow with [`Ends::connect`] to drop the node from the list (then
    /// [`unlock_self`](MtList::unlock_self) to make it detached), or with
    /// [`connect_elem`](MtList::connect_elem) to put it, or a different
    /// isolated node, back into the gap.
    ///
    /// # Safety
    ///
    /// Same contract as [`cut_after`](MtList::cut_after).
    #[cfg_attr(not(feature = "noinline"), inline)]
    #[cfg_attr(feature = "noinline", inline(never))]
    pub unsafe fn cut_around(&self) -> Ends {
        let mut backoff = Backoff::new();
        loop {
            match lock_full_attempt(self) {
                Ok(ends) => return ends,
                Err(Contended) => backoff.spin(),
            }
        }
    }

    /// Commits this node into the gap held by `ends`, releasing all four
    /// fields: the node ends up linked between the token's two neighbors.
    ///
    /// Works both for a fresh element (insert, append) and for a node
    /// isolated by [`cut_around`](MtList::cut_around), whose locked fields
    /// are overwritten by the final values.
    ///
    /// # Safety
    ///
    /// `ends` must come from a cut on a live list (or from
    /// [`cut_around`](MtList::cut_around) of this very node), and `self`
    /// must be either exclusively owned or the isolated node itself. All
    /// nodes involved must stay valid and in place.
    pub unsafe fn connect_elem(&self, ends: Ends) {
        let me = addr(self);
        let a = ends.prev_addr();
        let b = ends.next_addr();
        self.prev.unlock(a);
        self.next.unlock(b);
        node(b).prev.unlock(me);
        node(a).next.unlock(me);
    }

    /// Makes an isolated node (both fields locked, as left by
    /// [`cut_around`](MtList::cut_around)) detached by linking it to
    /// itself.
    ///
    /// # Safety
    ///
    /// Both of the node's fields must currently be owned by the calling
    /// thread and the node must no longer be reachable from any list.
    pub unsafe fn unlock_self(&self) {
        let me = addr(self);
        self.next.unlock(me);
        self.prev.unlock(me);
    }
}

impl Default for MtList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MtList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtList")
            .field("next", &(self.next.peek() as *const MtList))
            .field("prev", &(self.prev.peek() as *const MtList))
            .finish()
    }
}

/// The two endpoints of a cut link, still owned by the cutting thread.
///
/// The token stands for locked fields: `prev`'s forward field and `next`'s
/// backward field hold the lock sentinel until the token is consumed by
/// [`connect`](Ends::connect) or [`MtList::connect_elem`]. Dropping it
/// leaks the locks and wedges the list.
#[derive(Debug)]
#[must_use = "the cut link stays locked until the ends are reconnected"]
pub struct Ends {
    prev: NonNull<MtList>,
    next: NonNull<MtList>,
}

impl Ends {
    pub(crate) unsafe fn new(prev: usize, next: usize) -> Self {
        debug_assert_ne!(prev, BUSY);
        debug_assert_ne!(next, BUSY);
        Ends {
            prev: NonNull::new_unchecked(prev as *mut MtList),
            next: NonNull::new_unchecked(next as *mut MtList),
        }
    }

    /// The node on the earlier side of the owned gap.
    pub fn prev(&self) -> NonNull<MtList> {
        self.prev
    }

    /// The node on the later side of the owned gap.
    pub fn next(&self) -> NonNull<MtList> {
        self.next
    }

    pub(crate) fn prev_addr(&self) -> usize {
        self.prev.as_ptr() as usize
    }

    pub(crate) fn next_addr(&self) -> usize {
        self.next.as_ptr() as usize
    }

    /// Links the two captured endpoints directly to each other, releasing
    /// the locks. After a plain cut this restores the list exactly; after
    /// [`MtList::cut_around`] it closes the list over the isolated node.
    ///
    /// # Safety
    ///
    /// Both endpoints must still be valid and in place, with their facing
    /// fields owned by the calling thread through this token.
    pub unsafe fn connect(self) {
        let a = self.prev_addr();
        let b = self.next_addr();
        node(b).prev.unlock(a);
        node(a).next.unlock(b);
    }
}

/// One attempt at owning the forward link of `el`: its `next` field and the
/// matching backward field of the successor.
unsafe fn lock_next_attempt(el: &MtList) -> Result<Ends, Contended> {
    let mut claims = Claims::new();
    let n = claims.lock(&el.next)?;
    let back = claims.lock(&node(n).prev)?;
    debug_assert_eq!(back, addr(el));
    claims.commit();
    Ok(Ends::new(addr(el), n))
}

/// One attempt at owning the backward link of `el`: its `prev` field and
/// the matching forward field of the predecessor.
unsafe fn lock_prev_attempt(el: &MtList) -> Result<Ends, Contended> {
    let mut claims = Claims::new();
    let p = claims.lock(&el.prev)?;
    let fwd = claims.lock(&node(p).next)?;
    debug_assert_eq!(fwd, addr(el));
    claims.commit();
    Ok(Ends::new(p, addr(el)))
}

/// One attempt at owning both links around `el`, isolating it. A detached
/// node has no neighbor fields to own; the token then captures the node on
/// both sides.
unsafe fn lock_full_attempt(el: &MtList) -> Result<Ends, Contended> {
    let mut claims = Claims::new();
    let p = claims.lock(&el.prev)?;
    let n = claims.lock(&el.next)?;
    if p != addr(el) {
        let fwd = claims.lock(&node(p).next)?;
        debug_assert_eq!(fwd, addr(el));
    }
    if n != addr(el) {
        let back = claims.lock(&node(n).prev)?;
        debug_assert_eq!(back, addr(el));
    }
    claims.commit();
    Ok(Ends::new(p, n))
}

/// One attempt at attaching a possibly shared element next to `anchor`:
/// owns `el`'s own fields first, bails out with `Ok(false)` if `el` turns
/// out to be linked somewhere, then goes for the anchor link and commits.
unsafe fn try_splice_attempt(
    anchor: &MtList,
    el: &MtList,
    place: Place,
) -> Result<bool, Contended> {
    let mut claims = Claims::new();
    let p = claims.lock(&el.prev)?;
    let n = claims.lock(&el.next)?;
    if p != addr(el) || n != addr(el) {
        // Linked into some list. Dropping the claims restores its fields.
        return Ok(false);
    }
    let ends = match place {
        Place::After => lock_next_attempt(anchor)?,
        Place::Before => lock_prev_attempt(anchor)?,
    };
    claims.commit();
    el.connect_elem(ends);
    Ok(true)
}

/// One attempt at unlinking the first element: the head's forward link plus
/// both links of the first element itself.
unsafe fn pop_attempt(head: &MtList) -> Result<Option<NonNull<MtList>>, Contended> {
    let mut claims = Claims::new();
    let first = claims.lock(&head.next)?;
    if first == addr(head) {
        // Empty. The claims drop puts the head's forward field back.
        return Ok(None);
    }
    let el = node(first);
    let succ = claims.lock(&el.next)?;
    let back = claims.lock(&el.prev)?;
    debug_assert_eq!(back, addr(head));
    let succ_back = claims.lock(&node(succ).prev)?;
    debug_assert_eq!(succ_back, first);

    el.next.unlock(first);
    el.prev.unlock(first);
    node(succ).prev.unlock(addr(head));
    head.next.unlock(succ);
    claims.commit();
    Ok(Some(NonNull::new_unchecked(first as *mut MtList)))
}

/// One attempt at carrying away the whole chain: owns the two links around
/// the head, self-loops the head, and turns the chain into an open one.
unsafe fn behead_attempt(head: &MtList) -> Result<Option<NonNull<MtList>>, Contended> {
    let mut claims = Claims::new();
    let first = claims.lock(&head.next)?;
    if first == addr(head) {
        return Ok(None);
    }
    let first_back = claims.lock(&node(first).prev)?;
    debug_assert_eq!(first_back, addr(head));
    let last = claims.lock(&head.prev)?;
    debug_assert_ne!(last, addr(head));
    let last_fwd = claims.lock(&node(last).next)?;
    debug_assert_eq!(last_fwd, addr(head));

    // The chain keeps its backward circularity but opens forward.
    node(first).prev.unlock(last);
    node(last).next.unlock(0);
    head.next.unlock(addr(head));
    head.prev.unlock(addr(head));
    claims.commit();
    Ok(Some(NonNull::new_unchecked(first as *mut MtList)))
}
