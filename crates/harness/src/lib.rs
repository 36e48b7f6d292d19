pub mod fixtures;
pub mod pipeline;

pub use fixtures::{order, order_relations};
pub use pipeline::TestPipeline;
