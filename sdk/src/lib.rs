pub mod archive;
pub mod client;
pub mod crypto;
pub mod digest;
pub mod header;
pub mod pipe;
pub mod pipeline;
pub mod progress;
