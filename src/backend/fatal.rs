// Check-or-terminate helper
//
// The library propagates errors; the application decides which of them are
// fatal and routes those through `or_exit` so call sites stay straight-line.

use std::fmt::Debug;

/// Exit status used for every fatal condition
pub const FATAL_EXIT_CODE: i32 = 1;

/// Log a diagnostic and terminate immediately, without GPU-side teardown.
pub fn fatal(what: &str, detail: &dyn Debug) -> ! {
    log::error!("{}: {:?}", what, detail);
    log::logger().flush();
    std::process::exit(FATAL_EXIT_CODE)
}

pub trait OrExit<T> {
    /// Unwrap the success value or terminate the process after logging `what`.
    fn or_exit(self, what: &str) -> T;
}

impl<T, E: Debug> OrExit<T> for Result<T, E> {
    fn or_exit(self, what: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => fatal(what, &e),
        }
    }
}

impl<T> OrExit<T> for Option<T> {
    fn or_exit(self, what: &str) -> T {
        match self {
            Some(value) => value,
            None => fatal(what, &"missing value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_paths_pass_through() {
        let ok: Result<u32, String> = Ok(7);
        assert_eq!(ok.or_exit("unreachable"), 7);
        assert_eq!(Some("x").or_exit("unreachable"), "x");
    }
}
