pub mod orchestrator;
pub mod queue;
pub mod shutdown;
pub mod stats;

pub use orchestrator::{Pipeline, PipelineReport};
pub use queue::{latest_queue, QueueConsumer, QueueProducer};
pub use shutdown::Shutdown;
