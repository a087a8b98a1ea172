//! The composite lock layer: acquiring several link fields with rollback.
//!
//! An operation owns at most the four fields surrounding one element. It
//! acquires them one by one in its fixed order; the first field it cannot
//! get makes the whole attempt fail, and everything acquired so far is
//! restored in reverse order before the operation backs off and retries.

use arrayvec::ArrayVec;

use crate::link::Link;

/// Another thread owns a field the operation needs; roll back and retry.
#[derive(Debug)]
pub(crate) struct Contended;

/// The set of link fields acquired so far by one operation attempt.
///
/// Dropping the set rolls every field back to its remembered prior value,
/// newest first. [`commit`](Claims::commit) consumes the set without
/// restoring anything, once the final values have been stored or the fields
/// are deliberately left `BUSY` behind a locked-ends token.
pub(crate) struct Claims<'a> {
    held: ArrayVec<(&'a Link, usize), 4>,
}

impl<'a> Claims<'a> {
    pub(crate) fn new() -> Self {
        Claims {
            held: ArrayVec::new(),
        }
    }

    /// Acquires `link`, remembering its prior value for rollback.
    pub(crate) fn lock(&mut self, link: &'a Link) -> Result<usize, Contended> {
        match link.try_lock() {
            Some(prior) => {
                self.held.push((link, prior));
                Ok(prior)
            }
            None => Err(Contended),
        }
    }

    /// Keeps every acquired field exactly as it is now.
    pub(crate) fn commit(mut self) {
        self.held.clear();
    }
}

impl Drop for Claims<'_> {
    fn drop(&mut self) {
        while let Some((link, prior)) = self.held.pop() {
            link.unlock(prior);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Claims;
    use crate::link::{Link, BUSY};

    #[test]
    fn dropped_claims_roll_back() {
        let a = Link::null();
        let b = Link::null();
        a.unlock(0x1000);
        b.unlock(0x2000);
        {
            let mut claims = Claims::new();
            assert_eq!(claims.lock(&a).ok(), Some(0x1000));
            assert_eq!(claims.lock(&b).ok(), Some(0x2000));
            assert_eq!(a.peek(), BUSY);
            assert_eq!(b.peek(), BUSY);
        }
        assert_eq!(a.peek(), 0x1000);
        assert_eq!(b.peek(), 0x2000);
    }

    #[test]
    fn committed_claims_keep_final_values() {
        let a = Link::null();
        a.unlock(0x1000);
        let mut claims = Claims::new();
        claims.lock(&a).unwrap();
        a.unlock(0x3000);
        claims.commit();
        assert_eq!(a.peek(), 0x3000);
    }

    #[test]
    fn owned_field_reports_contention() {
        let a = Link::null();
        a.unlock(0x1000);
        let mut first = Claims::new();
        first.lock(&a).unwrap();
        let mut second = Claims::new();
        assert!(second.lock(&a).is_err());
        drop(second);
        // The loser restored nothing; the field still belongs to `first`.
        assert_eq!(a.peek(), BUSY);
    }
}
