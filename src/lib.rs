// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HEVC encoder control and bitstream-generation core.
//!
//! This crate implements the driver-independent half of a hardware H.265
//! encoder: configuration resolution, VPS/SPS/PPS/SEI/slice-header
//! synthesis, GOP structuring with B- and P-pyramids, DPB and reference
//! list management, long-term references, temporal layers, HRD timing and
//! CABAC-coded skip slices. The hardware-facing half (surface allocation
//! and slice execution) is supplied by the integrating component, which
//! consumes [`encoder::h265::Task`] descriptions frame by frame.

pub mod bitstream;
pub mod codec;
pub mod encoder;

pub use encoder::h265::Encoder;
pub use encoder::h265::EncoderConfig;
pub use encoder::h265::FrameControl;
pub use encoder::h265::Task;
pub use encoder::BrcStatus;
pub use encoder::CodedBitstreamBuffer;
pub use encoder::EncodeError;
pub use encoder::FrameMetadata;
pub use encoder::RateControl;
pub use encoder::Tunings;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
