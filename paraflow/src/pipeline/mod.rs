//! Pipeline orchestration: producer, bounded queue, worker pool, and the
//! streaming reconciler behind the public operators.

mod batch;
mod engine;
mod operators;
mod reconcile;
mod stream;

#[cfg(test)]
mod integration_tests;

pub use operators::{
    batch_parallel, batch_parallel_stream, for_each_parallel, for_each_parallel_stream,
    map_parallel, map_parallel_stream,
};
pub use stream::ResultStream;
