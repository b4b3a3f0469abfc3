// playsync_protocol — wire protocol for the tick/event synchronization relay.
//
// This crate defines the data model, the tick compression codec, the error
// taxonomy, the message types, and the framing used by the relay
// (`playsync_relay`) and simulation clients. It is shared by both sides and
// does no networking of its own.
//
// Module overview:
// - `types.rs`:    `PlayId`, `Tick`, `Event`/`EventFlags`, `TickFrame`,
//                  `TickPack`, `StartPoint`, `Permission`, query options.
// - `codec.rs`:    `pack` / `unpack` between per-frame ticks and the compact
//                  `TickPack` wire form.
// - `error.rs`:    Flat `ErrorKind` taxonomy, `AmflowError`, `ErrorPayload`.
// - `message.rs`:  `ClientMessage` and `ServerMessage` enums.
// - `framing.rs`:  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON serialization.** Events and snapshots are opaque JSON values the
//   relay stores and forwards without interpreting.
// - **No async runtime.** Framing works on `std::io::Read`/`Write`, for
//   blocking TCP streams and buffered wrappers alike.

pub mod codec;
pub mod error;
pub mod framing;
pub mod message;
pub mod types;

pub use codec::{pack, pack_into, unpack, unpack_all, unpack_value};
pub use error::{AmflowError, ErrorKind, ErrorPayload};
pub use framing::{
    FramingError, MAX_MESSAGE_SIZE, read_frame, read_json, write_frame, write_json,
};
pub use message::{ClientMessage, RequestId, ResponseBody, ServerMessage};
pub use types::{
    Event, EventFlags, Frame, GetStartPointOptions, GetTickListOptions, Permission,
    PermissionKind, PlayEndReason, PlayId, StartPoint, Tick, TickFrame, TickPack,
};
