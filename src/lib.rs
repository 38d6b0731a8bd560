pub mod blockstream;
pub mod cli;
pub mod codec;
pub mod config;
pub mod ingestor;
pub mod pipeline;
pub mod source;
pub mod storage;
