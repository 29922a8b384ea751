// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod h265;

use thiserror::Error;

use crate::codec::h265::dpb::DpbError;
use crate::codec::h265::nalu_writer::NaluWriterError;
use crate::codec::h265::skip_slice::SkipSliceError;
use crate::codec::h265::synthesizer::SynthesizerError;
use crate::Resolution;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("unsupported encoder configuration: {0}")]
    Unsupported(String),
    #[error("invalid internal state. This is likely a bug.")]
    InvalidInternalState,
    #[error("not enough space in the output buffer")]
    NotEnoughBuffer,
    #[error("failed to parse parameter sets: {0}")]
    Parse(String),
    #[error(transparent)]
    Synthesize(#[from] SynthesizerError),
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
    #[error(transparent)]
    SkipSlice(#[from] SkipSliceError),
}

impl From<DpbError> for EncodeError {
    fn from(err: DpbError) -> Self {
        log::error!("DPB failure: {err}");
        EncodeError::InvalidInternalState
    }
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// Specifies the encoder operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateControl {
    /// The encoder shall maintain the constant bitrate
    ConstantBitrate(u64),

    /// The encoder shall maintain codec specific quality parameter constant (eg. QP for H.265)
    /// disregarding bitrate.
    ConstantQuality(u32),
}

impl RateControl {
    pub(crate) fn is_same_variant(left: &Self, right: &Self) -> bool {
        std::mem::discriminant(left) == std::mem::discriminant(right)
    }

    pub(crate) fn bitrate_target(&self) -> Option<u64> {
        match self {
            RateControl::ConstantBitrate(target) => Some(*target),
            RateControl::ConstantQuality(_) => None,
        }
    }
}

/// Dynamic parameters of the encoded stream that client may choose to change during the encoding
/// session without recreating the entire encoder instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunings {
    /// The stream's [`RateControl`]
    pub rate_control: RateControl,
    /// Stream framerate in frames per second
    pub framerate: u32,
    /// Minimum value of codec specific quality parameter constant (eg. QP for H.265)
    pub min_quality: u32,
    /// Maximum value of codec specific quality parameter constant (eg. QP for H.265)
    pub max_quality: u32,
}

impl Default for Tunings {
    fn default() -> Self {
        Self {
            rate_control: RateControl::ConstantBitrate(200_000),
            framerate: 30,
            min_quality: 0,
            max_quality: u32::MAX,
        }
    }
}

/// Encoder's input metadata
#[derive(Clone, Debug)]
pub struct FrameMetadata {
    pub timestamp: u64,
    pub display_resolution: Resolution,
    pub force_keyframe: bool,
}

/// Outcome of checking one encoded frame against the rate-control buffer.
/// Anything but [`BrcStatus::Ok`] asks for a re-encode with adjusted
/// parameters; the recode loop is bounded by the configured recode count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrcStatus {
    Ok,
    /// The frame overflows the buffer and must be re-encoded bigger-QP.
    BigFrame,
    /// The frame underruns a CBR buffer and needs padding or a smaller QP.
    SmallFrame,
}

/// Encoder's coded output with contained frame.
pub struct CodedBitstreamBuffer {
    /// [`FrameMetadata`] of the frame that is compressed in [`Self::bitstream`]
    pub metadata: FrameMetadata,

    /// Bitstream with compressed frame together with optionally other compressed control messages
    pub bitstream: Vec<u8>,
}

impl CodedBitstreamBuffer {
    pub fn new(metadata: FrameMetadata, bitstream: Vec<u8>) -> Self {
        Self {
            metadata,
            bitstream,
        }
    }
}

impl From<CodedBitstreamBuffer> for Vec<u8> {
    fn from(value: CodedBitstreamBuffer) -> Self {
        value.bitstream
    }
}
