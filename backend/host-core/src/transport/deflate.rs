//! permessage-deflate (RFC 7692) with context takeover and a 15-bit window.

use crate::error::channel::ChannelError;

use common::ErrorLocation;

use std::panic::Location;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Trailer produced by a sync flush; stripped on send, re-appended on receive.
pub const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const OUTPUT_RESERVE: usize = 16 * 1024;
const MIN_SPARE_CAPACITY: usize = 64;

pub struct Deflater {
    compress: Compress,
}

impl Deflater {
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::default(), false),
        }
    }

    pub fn deflate(&mut self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut output = Vec::with_capacity(payload.len() / 2 + MIN_SPARE_CAPACITY);
        let mut consumed = 0usize;

        loop {
            if output.capacity() - output.len() < MIN_SPARE_CAPACITY {
                output.reserve(OUTPUT_RESERVE);
            }

            let before = self.compress.total_in();
            self.compress
                .compress_vec(&payload[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| ChannelError::Compression {
                    message: format!("deflate failed: {e}"),
                    location: ErrorLocation::from(Location::caller()),
                })?;
            consumed += (self.compress.total_in() - before) as usize;

            if consumed >= payload.len() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TAIL) {
            output.truncate(output.len() - DEFLATE_TAIL.len());
        }
        Ok(output)
    }
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Inflater that can record its compressed input.
///
/// The recording is the resume state a new process needs to rebuild the
/// sliding window: feeding it to a fresh inflater via [`Inflater::prime`]
/// leaves that inflater in the same state as this one.
pub struct Inflater {
    decompress: Decompress,
    recording: Option<Vec<u8>>,
}

impl Inflater {
    pub fn new(record: bool) -> Self {
        Self {
            decompress: Decompress::new(false),
            recording: record.then(Vec::new),
        }
    }

    /// Inflate one complete message payload (without its tail).
    pub fn inflate(&mut self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TAIL);

        if let Some(recording) = self.recording.as_mut() {
            recording.extend_from_slice(&input);
        }

        self.run(&input)
    }

    /// Replay previously recorded input, discarding the output.
    pub fn prime(&mut self, recorded: &[u8]) -> Result<(), ChannelError> {
        if recorded.is_empty() {
            return Ok(());
        }
        self.run(recorded).map(|_| ())
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn recorded(&self) -> &[u8] {
        self.recording.as_deref().unwrap_or_default()
    }

    pub fn stop_recording(&mut self) {
        self.recording = None;
    }

    fn run(&mut self, input: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut output = Vec::with_capacity(input.len() * 3 + MIN_SPARE_CAPACITY);
        let mut consumed = 0usize;

        loop {
            if output.capacity() - output.len() < MIN_SPARE_CAPACITY {
                output.reserve(OUTPUT_RESERVE);
            }

            let before_in = self.decompress.total_in();
            let before_out = output.len();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| ChannelError::Compression {
                    message: format!("inflate failed: {e}"),
                    location: ErrorLocation::from(Location::caller()),
                })?;
            let read = (self.decompress.total_in() - before_in) as usize;
            consumed += read;

            if status == Status::StreamEnd {
                break;
            }
            if consumed >= input.len() && output.len() < output.capacity() {
                break;
            }
            if read == 0 && output.len() == before_out {
                if consumed >= input.len() {
                    break;
                }
                return Err(ChannelError::Compression {
                    message: "inflate made no progress".to_string(),
                    location: ErrorLocation::from(Location::caller()),
                });
            }
        }

        Ok(output)
    }
}
