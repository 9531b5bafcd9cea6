//! Status reconciliation for `HeaderPropagationPolicy` resources.
//!
//! The [`Index`] tracks policies and pods from the runtime's watches and
//! enqueues reconciliation work; the [`Controller`] drains that queue,
//! re-reads cluster state through the API, and patches each policy's
//! status subresource. The reconciler never mutates pods.

#![forbid(unsafe_code)]

mod index;
mod resource_id;


pub use self::index::{Controller, Index, SharedIndex, Update, SWEEP_PERIOD};
pub use self::resource_id::ResourceId;
