//! Execution context switching
//!
//! The boundary a thread is executing inside is held in thread-local storage
//! and only changed through [`BoundaryScope`], which restores the previous
//! value when dropped. Restoration therefore happens on every exit path,
//! including early returns and unwinding panics.

use std::cell::Cell;
use std::marker::PhantomData;

use crate::boundary::BoundaryId;

thread_local! {
    static ACTIVE_BOUNDARY: Cell<Option<BoundaryId>> = const { Cell::new(None) };
}

/// The boundary the current thread is executing inside, if any.
pub fn active_boundary() -> Option<BoundaryId> {
    ACTIVE_BOUNDARY.with(Cell::get)
}

/// Proof that the current thread is executing inside a boundary.
///
/// Not `Send`: a scope is tied to the thread that entered it.
#[must_use = "the boundary is left as soon as the scope is dropped"]
pub struct BoundaryScope {
    boundary: BoundaryId,
    previous: Option<BoundaryId>,
    _not_send: PhantomData<*const ()>,
}

impl BoundaryScope {
    pub(crate) fn enter(boundary: BoundaryId) -> Self {
        let previous = ACTIVE_BOUNDARY.with(|cell| cell.replace(Some(boundary)));
        Self {
            boundary,
            previous,
            _not_send: PhantomData,
        }
    }

    pub fn boundary(&self) -> BoundaryId {
        self.boundary
    }
}

impl Drop for BoundaryScope {
    fn drop(&mut self) {
        ACTIVE_BOUNDARY.with(|cell| cell.set(self.previous));
    }
}
