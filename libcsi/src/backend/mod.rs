//! Storage backend implementations.
//!
//! Each backend provides concrete types implementing [`CsiIdentity`],
//! [`CsiController`], and [`CsiNode`].
//!
//! [`CsiIdentity`]: crate::identity::CsiIdentity
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode

pub mod rawfile;
