//! `fluxcap-reassembly`: fragment reassembly (C5), the multipart payload
//! primitive (C7), and the stream reassembler/parser (C6).

pub mod fragment;
pub mod multipart;
pub mod stream;

pub use fragment::{FragmentOutcome, FragmentReassembler};
pub use multipart::{Chunk, Multipart};
pub use stream::{StreamError, StreamParser, TextState};
