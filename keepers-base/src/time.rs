// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Abstractions over time, so that the rest of the code does not depend on where clocks and
timers come from.

[`Instant`] is Tokio's, so that paused test clocks also drive cache expiration.
 */

pub use std::time::*;
pub use tokio::time as timer;
pub use tokio::time::Instant;
