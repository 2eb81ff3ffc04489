// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared between the barry crates.

use std::{future::Future, time::Duration};

/// A result type useful in tests, that wraps any error implementation.
pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Macro for creating parametrized tests.
///
/// Accepts the name of an existing test function followed by a list of case names and their
/// arguments, and expands to a module with one `#[test]` per case.
///
/// ```
/// # use barry_test_utils::param_test;
/// param_test! {
///     test_sum: [
///         positive: (10, 7, 17),
///         negative: (-5, -3, -8),
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
#[macro_export]
macro_rules! param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[test]
                $(#[$outer])*
                fn $case_name() -> $return_ty {
                    $func_name($($args),*)
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::param_test!(
            $func_name -> (): [ $( $(#[$outer])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}

/// Macro for creating parametrized *asynchronous* tests, mirroring [`param_test!`].
///
/// Each case is annotated with `#[tokio::test]` and awaits the named `async fn`.
#[macro_export]
macro_rules! async_param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[tokio::test]
                $(#[$outer])*
                async fn $case_name() -> $return_ty {
                    $func_name($($args),*).await
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::async_param_test!(
            $func_name -> (): [ $( $(#[$outer])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}

/// Polls `condition` every 10 ms until it returns true or `timeout` elapses.
///
/// Returns `true` iff the condition was observed to hold before the timeout.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Returns `len` random bytes.
pub fn random_data(len: usize) -> Vec<u8> {
    use rand::RngCore;

    let mut data = vec![0; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    param_test! {
        checks_sum: [
            small: (1, 2, 3),
            zero: (0, 0, 0),
        ]
    }
    fn checks_sum(lhs: u32, rhs: u32, sum: u32) {
        assert_eq!(lhs + rhs, sum);
    }

    #[tokio::test]
    async fn wait_until_observes_condition() {
        assert!(wait_until(Duration::from_secs(1), || async { true }).await);
        assert!(!wait_until(Duration::from_millis(50), || async { false }).await);
    }
}
