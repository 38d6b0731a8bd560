pub mod oneblock;
pub mod traits;

pub use oneblock::OneBlockStore;
pub use traits::{BlockSink, SinkError};
