// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Node-join bootstrap: computing who ships which token range to a newly
//! joining replica, and driving that hand-off to completion.
//!
//! [`crate::app::ring`] supplies the token/range arithmetic this module's
//! plan computation (`delta`) is built on.

pub mod chooser;
pub mod context;
pub mod delta;
pub mod driver;
pub mod error;
pub mod metadata;
pub mod newcomer;
pub mod source;
pub mod stream;
pub mod verbs;

pub use context::BootstrapContext;
pub use driver::{
    on_peer_joined,
    run_bootstrap,
};
pub use error::BootstrapError;
