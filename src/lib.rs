// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]
//! A token-ring storage node's bootstrap (node-join) subsystem: computing
//! which existing replicas ship which token ranges to a newly joining
//! node, and driving that hand-off through to completion.

pub mod app;
