//! # sph_net
//!
//! Wire contracts and endpoint addressing for the SPH control plane.
//!
//! This crate provides:
//!
//! - [`address`]: `[authkey@][host:]port[+]` endpoint address parsing.
//! - [`messages`]: Commands, replies, and pool session frames.
//! - [`codec`]: MessagePack and JSON-line serialisation helpers.
//! - [`framing`]: Length-prefixed frames over async byte streams.
//! - [`error`]: Network-layer error types.

pub mod address;
pub mod codec;
pub mod error;
pub mod framing;
pub mod messages;

pub use address::{AddressError, DEFAULT_AUTHKEY, DEFAULT_HOST, DEFAULT_POOL_ADDRESS, EndpointAddress};
pub use codec::{decode, decode_line, encode, encode_line};
pub use error::NetError;
pub use framing::{FrameError, MAX_FRAME_SIZE, read_frame, write_frame};
pub use messages::{ClientFrame, Command, CommandReply, ServerFrame};
