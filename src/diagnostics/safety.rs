//! Corruption handling.
//!
//! Double frees and bitmap inconsistencies are never recovered: the
//! failure is reported, an embedder-installed hook gets a chance to run
//! (crash reporters, test harnesses), and the process aborts.

use std::sync::Mutex;

type AbortHook = Box<dyn Fn(&str) + Send + Sync>;

static ABORT_HOOK: Mutex<Option<AbortHook>> = Mutex::new(None);

/// Install a hook invoked with the failure message before the process
/// aborts. Returns the previously installed hook.
pub fn set_safety_abort_hook(hook: Option<AbortHook>) -> Option<AbortHook> {
    std::mem::replace(&mut ABORT_HOOK.lock().expect("abort hook lock"), hook)
}

/// Report a corruption and abort. The hook may itself panic or abort
/// first (test harnesses rely on that).
pub(crate) fn fail(msg: &str) -> ! {
    log::error!("fatal allocator corruption: {}", msg);
    if let Ok(hook) = ABORT_HOOK.lock() {
        if let Some(hook) = hook.as_ref() {
            hook(msg);
        }
    }
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_install_and_replace() {
        let _ = set_safety_abort_hook(Some(Box::new(|_| {})));
        let installed = set_safety_abort_hook(None);
        assert!(installed.is_some());
    }
}
