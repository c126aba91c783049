// pkv-common - Wire protocol shared by the PipeKV client crates
//
// This crate defines RESP2 request encoding and the resumable reply decoder

pub mod codec;
pub mod error;
pub mod resp;

// Re-export for convenience
pub use codec::*;
pub use error::*;
pub use resp::*;
