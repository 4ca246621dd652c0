//! `Dupe`: a marker for cheap, reference-counted clones.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Cheap-to-clone types. Unlike a blanket `Clone`, calling `dupe` signals
/// that no deep copy happens.
pub trait Dupe {
    /// A cheap clone of `self`.
    #[must_use]
    fn dupe(&self) -> Self;
}

impl<T: ?Sized> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Self::clone(self)
    }
}

impl Dupe for Bytes {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for mpsc::UnboundedSender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}
