pub mod channel;
pub mod head;
pub mod range;
pub mod runner;

pub use channel::{create_channel, Receiver, Sender};
pub use head::{HeadError, HeadInfo, HeadReader, HeadTracker};
pub use range::{BatchRange, RangeDecision};
pub use runner::{
    run_decoder, run_fanout, run_reader, DecoderOutcome, FanoutStats, PipelineError, ReaderOutcome,
};
