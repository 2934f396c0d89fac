use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

/// Invokes an application callback, containing a panic inside it. Returns `None` if the callback
///  panicked.
///
/// Callbacks run on background tasks, and a panic would otherwise terminate the task and silently
///  stop delivery for all other callbacks.
pub fn invoke_guarded<R>(callback_kind: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(panic) => {
            error!(callback = callback_kind, panic = panic_message(panic.as_ref()), "application callback panicked");
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    }
    else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    }
    else {
        "<no message>"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_invoke_guarded_returns_result() {
        assert_eq!(invoke_guarded("test", || 3), Some(3));
    }

    #[test]
    fn test_invoke_guarded_contains_panic() {
        let mut counter = 0;
        let result: Option<()> = invoke_guarded("test", || {
            counter += 1;
            panic!("boom");
        });
        assert!(result.is_none());
        assert_eq!(counter, 1);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"abc"), "abc");
        assert_eq!(panic_message(&"xyz".to_string()), "xyz");
        assert_eq!(panic_message(&5), "<no message>");
    }
}
