//! Gateway command protocol.

pub mod codec;
pub mod framing;
pub mod message;
pub mod registry;

pub use framing::{EnvelopeFraming, FrameCodec, SlipCodec};
pub use message::{Fields, MessageRole, OpcodeRef, Record, Request, confirmation_name};
pub use registry::{OpcodeRegistry, PayloadDecoder, PayloadEncoder, StandardRegistry};
