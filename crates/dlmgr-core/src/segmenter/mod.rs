//! Range math, segment planning, and resume validation.
//!
//! Splits a download into `worker_count` segments (last one absorbs any
//! remainder byte), computes HTTP Range header bounds, and repairs a loaded
//! segment set against expected lengths before resuming (§4.1, §4.2).

mod range;

pub use range::{
    partitions_exactly, plan_segments, unbounded_segment, validate_segments, Segment,
    UNBOUNDED_END,
};
