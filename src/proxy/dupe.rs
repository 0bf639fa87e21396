//! Explicitly cheap clones.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::sync::Arc;

/// A cheap-to-duplicate handle: cloning copies the reference, not the data.
pub trait Dupe: Clone {
    /// Duplicate the handle.
    #[must_use]
    fn dupe(&self) -> Self;
}

impl<T> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Self::clone(self)
    }
}
