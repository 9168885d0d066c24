//! Test harness shared by every crate in the workspace.
//!
//! Tests are plain `fn() -> TestResult` functions using the assertion
//! macros below, grouped with [`define_test_suite!`](crate::define_test_suite)
//! which turns each one into a `#[test]` that also routes `klog` output to
//! the host console.

mod assertions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail)
    }
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

/// Expand a list of `fn() -> TestResult` into `#[test]` functions inside a
/// generated `<suite>_suite` module.
///
/// Each generated test installs a host console backend for `klog` so that
/// assertion messages show up in the test output, runs the function and
/// fails unless it returned [`TestResult::Pass`] or
/// [`TestResult::Skipped`].
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:ident),* $(,)?]) => {
        $crate::paste::paste! {
            #[cfg(test)]
            mod [<$suite_name _suite>] {
                fn host_backend(args: ::core::fmt::Arguments<'_>) {
                    ::std::println!("{}", args);
                }

                $(
                    #[test]
                    fn $test_fn() {
                        $crate::klog::klog_register_backend(host_backend);
                        let result = super::$test_fn();
                        assert!(
                            !result.is_failure(),
                            "{}::{} returned {:?}",
                            stringify!($suite_name),
                            stringify!($test_fn),
                            result
                        );
                    }
                )*
            }
        }
    };
}
