// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Resona FLAC
//!
//! A pure Rust encoder and decoder for the Free Lossless Audio Codec (FLAC) bitstream.
//!
//! The decoder, [`StreamDecoder`], synchronizes on a native FLAC stream, parses its metadata
//! blocks, decodes frames to bit-exact PCM, verifies frame checksums, and supports seeking to an
//! arbitrary sample using the stream's seek table. The encoder, [`StreamEncoder`], compresses
//! planar or interleaved PCM into a native FLAC stream, choosing per-frame stereo decorrelation,
//! per-channel predictors, and partitioned Rice entropy parameters, and can verify its own output
//! against the original samples while encoding.
//!
//! Container handling (WAV, AIFF, Ogg), command-line concerns, and loudness analysis are outside
//! the scope of this crate.

mod decoder;
mod encoder;
mod fixed;
mod frame;
mod lpc;
mod metadata;
mod rice;
mod subframe;
mod verify;

pub use decoder::{DecoderOptions, ErrorStatus, FinalizeResult, StreamDecoder};
pub use encoder::{EncoderOptions, StreamEncoder};
pub use frame::{BlockSequence, BlockingStrategy, ChannelAssignment, FrameHeader};
pub use metadata::{
    MetadataBlock, MetadataBlockHeader, MetadataBlockType, SeekPoint, SeekTable, SeekTableSpec,
    StreamInfo, VorbisComment,
};
pub use verify::VerifyMismatch;
