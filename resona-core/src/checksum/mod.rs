// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `checksum` module provides implementations of common error-detecting codes and hashing
//! algorithms.

mod crc16;
mod crc8;
mod md5;

pub use crc16::{crc16_of, Crc16Ansi};
pub use crc8::{crc8_of, Crc8Ccitt};
pub use md5::Md5;
