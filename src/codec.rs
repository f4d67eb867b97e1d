// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec-level definitions, independent of the decode engine driving them.

pub mod vp9;
