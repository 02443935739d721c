//! Stream decoding for anchor ranging data

pub mod parser;

pub use parser::{decode_line, FrameParser, Frames, ParseError};
