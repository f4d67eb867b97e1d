// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VP9 definitions shared by the decode state machine: the parameter records a client hands
//! over for each frame, the default probability tables, and the frame context buffer layout
//! the decode engine reads them from.

pub mod context_buffer;
pub mod params;
pub mod probs;
