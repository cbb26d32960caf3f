//! Multi-round protocols over [`ShareSet`](crate::share::ShareSet)s. Each
//! round is a `try_join_all` across parties; a failed round aborts the whole
//! operation.

pub(crate) mod cmp;
pub(crate) mod div;
pub(crate) mod linear;
pub(crate) mod mul;
pub(crate) mod reduce;
