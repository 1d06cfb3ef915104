//! Frame codec - conversion between interleaved host blocks and planar graph buffers
//!
//! The host server works on interleaved 32-bit float frames, the graph hands out
//! one buffer per port (channel). These routines convert between the two.
//!
//! # Real-Time Safety
//! Every function here is called from the graph's process callback:
//! - No heap allocations
//! - No locks or blocking calls
//! - Errors are plain `Copy` values

use crate::error::CodecError;

/// Maximum number of channels per endpoint.
pub const MAX_CHANNELS: usize = 32;

/// Size in bytes of one sample (32-bit native-endian float).
pub const SAMPLE_SIZE: usize = std::mem::size_of::<f32>();

fn check_channels(channels: usize) -> Result<(), CodecError> {
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(CodecError::TooManyChannels { channels });
    }
    Ok(())
}

fn check_len(needed: usize, available: usize) -> Result<(), CodecError> {
    if available < needed {
        return Err(CodecError::BufferTooSmall { needed, available });
    }
    Ok(())
}

/// Interleave `frames` frames from per-channel buffers into `out`.
///
/// The channel count is `planar.len()`. Returns the number of samples written.
pub fn interleave(planar: &[&[f32]], frames: usize, out: &mut [f32]) -> Result<usize, CodecError> {
    let channels = planar.len();
    check_channels(channels)?;
    let total = frames * channels;
    check_len(total, out.len())?;
    for channel in planar {
        check_len(frames, channel.len())?;
    }

    for (c, channel) in planar.iter().enumerate() {
        for (frame, sample) in channel[..frames].iter().enumerate() {
            out[frame * channels + c] = *sample;
        }
    }
    Ok(total)
}

/// Split `frames` interleaved frames from `input` into per-channel buffers.
pub fn deinterleave(
    input: &[f32],
    planar: &mut [&mut [f32]],
    frames: usize,
) -> Result<(), CodecError> {
    let channels = planar.len();
    check_channels(channels)?;
    check_len(frames * channels, input.len())?;
    for channel in planar.iter() {
        check_len(frames, channel.len())?;
    }

    for (c, channel) in planar.iter_mut().enumerate() {
        for (frame, sample) in channel[..frames].iter_mut().enumerate() {
            *sample = input[frame * channels + c];
        }
    }
    Ok(())
}

/// Write `frames` frames of silence into every channel buffer.
pub fn fill_silence(planar: &mut [&mut [f32]], frames: usize) -> Result<(), CodecError> {
    check_channels(planar.len())?;
    for channel in planar.iter_mut() {
        check_len(frames, channel.len())?;
        channel[..frames].fill(0.0);
    }
    Ok(())
}

/// Bytes occupied by one frame of `channels` samples.
pub fn frame_size(channels: usize) -> usize {
    channels * SAMPLE_SIZE
}
