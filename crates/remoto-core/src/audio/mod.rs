//! Audio backend
//!
//! The real `PlaybackBackend`: HTTP download, symphonia decoding and cpal
//! output.

pub mod decoder;
pub mod output;
pub mod source;
pub mod stream;

pub use decoder::{ Decoder, DecoderError };
pub use output::{ AudioOutput, OutputError, SampleBuffer };
pub use stream::{ StreamError, StreamingBackend, StreamingBackendFactory };
