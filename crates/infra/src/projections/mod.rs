//! Read models built from the event streams.
//!
//! Projections consume stored events as envelopes and keep a cursor per
//! aggregate, so feeding the same event twice is a no-op and a missed event
//! shows up as a gap instead of silently diverging. They can always be rebuilt
//! from the streams.

pub mod grouped_orders;

pub use grouped_orders::{GroupedOrderIndex, IndexError};
