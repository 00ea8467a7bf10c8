pub mod config;
pub mod controller;
pub mod error;
pub mod normalize;
pub mod queue;
pub mod receiver;
pub mod stats;
pub mod subscriber;
pub mod writer;

pub use config::PipelineConfig;
pub use controller::{Controller, Phase, RunReport};
pub use error::{MalformedMessageError, RelayError};
pub use queue::{relay_queue, RelayConsumer, RelayProducer};
pub use receiver::Receiver;
pub use stats::{PipelineStats, StatsSnapshot};
pub use subscriber::{AckHandle, MessageHandler, PullOutcome, StreamingPull, SubscriberSettings, subscribe};
pub use writer::Writer;
