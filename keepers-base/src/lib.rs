// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! This module provides the shared primitives of the upkeep coordination plugin: the
//! identifiers of upkeeps and blocks, the results of checking an upkeep, and a few
//! general-purpose utilities such as expiring caches.

#![deny(missing_docs)]

pub mod cache;
pub mod data_types;
pub mod identifiers;
pub mod limited_writer;
#[cfg(with_metrics)]
pub mod prometheus_util;
pub mod time;

/// A macro for asserting that a condition is true, returning an error if it is not.
///
/// # Examples
///
/// ```
/// # use keepers_base::ensure;
/// fn divide(x: i32, y: i32) -> Result<i32, String> {
///     ensure!(y != 0, String::from("division by zero"));
///     Ok(x / y)
/// }
///
/// assert_eq!(divide(10, 2), Ok(5));
/// assert_eq!(divide(10, 0), Err(String::from("division by zero")));
/// ```
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}
