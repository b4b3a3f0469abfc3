// Tick compression for the wire.
//
// `pack` turns an explicit per-frame tick sequence into the shortest
// `TickPack` sequence the greedy rule allows; `unpack` expands one pack back
// into ticks. Packing scans left to right for the leading run of event-free
// ticks:
//
//   run of 0  -> the event-carrying Tick itself
//   run of 1  -> the bare frame number
//   run of 2+ -> TickFrame { from, to }
//
// A run only continues while frame numbers are consecutive, so a gap in the
// input starts a new run. With that rule `unpack` over `pack(ticks)` always
// yields `ticks` again, and the output never has more elements than the
// input.
//
// Decoding a raw JSON value that is none of the three shapes (or a
// `TickFrame` with `from > to`) is a `BadRequest`. Callers processing a batch
// treat a failed pack as zero ticks and keep going.

use serde::Deserialize;

use crate::error::AmflowError;
use crate::types::{Frame, Tick, TickFrame, TickPack};

/// Largest number of frames one `TickFrame` may expand to.
pub const MAX_RANGE_FRAMES: Frame = 1 << 20;

/// Pack `ticks` into a fresh vector.
pub fn pack(ticks: &[Tick]) -> Vec<TickPack> {
    let mut out = Vec::new();
    pack_into(ticks, &mut out);
    out
}

/// Pack `ticks`, appending to `base`.
pub fn pack_into(ticks: &[Tick], base: &mut Vec<TickPack>) {
    let mut rest = ticks;
    while let Some(first) = rest.first() {
        let run = empty_run_len(rest);
        match run {
            0 => {
                base.push(TickPack::Tick(first.clone()));
                rest = &rest[1..];
            }
            1 => {
                base.push(TickPack::Frame(first.frame));
                rest = &rest[1..];
            }
            n => {
                base.push(TickPack::Range(TickFrame {
                    from: first.frame,
                    to: rest[n - 1].frame,
                }));
                rest = &rest[n..];
            }
        }
    }
}

/// Length of the leading run of event-free ticks with consecutive frames.
fn empty_run_len(ticks: &[Tick]) -> usize {
    let mut len = 0;
    for (i, tick) in ticks.iter().enumerate() {
        if tick.has_events() {
            break;
        }
        if i > 0 && tick.frame != ticks[i - 1].frame + 1 {
            break;
        }
        len += 1;
    }
    len
}

/// Expand one pack into the ticks it stands for.
pub fn unpack(pack: &TickPack) -> Result<Vec<Tick>, AmflowError> {
    match pack {
        TickPack::Frame(frame) => Ok(vec![Tick::bare(*frame)]),
        TickPack::Tick(tick) => Ok(vec![tick.clone()]),
        TickPack::Range(TickFrame { from, to }) => {
            if from > to {
                return Err(AmflowError::bad_request(format!(
                    "invalid tick frame: from {from} > to {to}"
                )));
            }
            if to.saturating_sub(*from) >= MAX_RANGE_FRAMES {
                return Err(AmflowError::bad_request(format!(
                    "tick frame {from}..={to} exceeds {MAX_RANGE_FRAMES} frames"
                )));
            }
            Ok((*from..=*to).map(Tick::bare).collect())
        }
    }
}

/// Decode a raw JSON value as a `TickPack` and expand it.
pub fn unpack_value(value: &serde_json::Value) -> Result<Vec<Tick>, AmflowError> {
    let pack = TickPack::deserialize(value)
        .map_err(|e| AmflowError::bad_request(format!("invalid tick pack: {e}")))?;
    unpack(&pack)
}

/// Expand a sequence of packs, concatenating the results.
pub fn unpack_all(packs: &[TickPack]) -> Result<Vec<Tick>, AmflowError> {
    let mut ticks = Vec::new();
    for pack in packs {
        ticks.extend(unpack(pack)?);
    }
    Ok(ticks)
}
