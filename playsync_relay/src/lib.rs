// playsync_relay — tick and event relay for lockstep play sessions.
//
// The relay sits between one active simulation instance and any number of
// passive viewers of the same play. The active instance writes ticks (frame
// numbers, optionally carrying events); the relay appends them to the
// play's log, fans them out to every subscribed connection, and serves
// range queries and start-point snapshots so late joiners can catch up. It
// never runs the simulation itself.
//
// Module overview:
// - `backend.rs`:  `KvBackend`, the key/value capability set the log is
//                  stored in, and `MemoryBackend`, its in-process version.
// - `store.rs`:    `PlayStore`, one play's log: tick acceptance, range
//                  reconstruction, start points, and access tokens.
// - `registry.rs`: `Registry`, the live plays of the process and their
//                  subscribers; lifecycle (start/end/extend) and fan-out.
// - `rpc.rs`:      Per-connection scoping and dispatch of client messages
//                  onto the registry.
// - `server.rs`:   TCP listener, reader and writer threads, and the main
//                  event loop that owns the `Registry`.
// - `client.rs`:   `NetClient`, a blocking client with pipelined requests.
//
// Dependencies: `playsync_protocol` (shared message types, tick codec, and
// framing).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in a
// host process via the library API (`start_relay`).

pub mod backend;
pub mod client;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod store;

pub use client::NetClient;
pub use server::{RelayConfig, RelayHandle, start_relay};
