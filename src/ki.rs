//! Keyboard-interrupt protection (§4.6).
//!
//! A keyboard interrupt (`SIGINT`) may arrive at any instruction. The
//! source's per-frame `LOCALS_KEY_KI_PROTECTION_ENABLED` flag becomes, in
//! this crate, a per-thread protection-depth counter (§9's "KI protection
//! flag storage" note): `enable_ki_protection`/`disable_ki_protection`
//! push/pop it around a region, and the signal adaptor consults the
//! current depth to decide whether delivery is safe to defer or must be
//! raised immediately.
//!
//! The signal source itself is a plain `SIGINT` handler registered via
//! `signal-hook`'s flag registration, sampled once per run-loop
//! iteration. The design notes (carried over from the original Python
//! sources' own discussion of signalfd/kqueue/handler tradeoffs) settle
//! on this as the simplest sufficient mechanism; there's no portable
//! advantage to a platform-native notification channel for one coarse
//! flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

thread_local! {
    static PROTECTION_DEPTH: std::cell::Cell<u32> = std::cell::Cell::new(0);
}

/// True if the currently executing frame is KI-protected — system tasks
/// run protected by default; ordinary user task bodies run unprotected
/// unless they explicitly opt in.
pub fn ki_protected() -> bool {
    PROTECTION_DEPTH.with(|d| d.get() > 0)
}

/// Enter a protected region. Nested calls compose as a depth counter, not
/// a flag, so a protected system task calling into another protected
/// helper doesn't prematurely unprotect itself when the inner region
/// exits.
pub fn enable_ki_protection() {
    PROTECTION_DEPTH.with(|d| d.set(d.get() + 1));
}

pub fn disable_ki_protection() {
    PROTECTION_DEPTH.with(|d| {
        let cur = d.get();
        d.set(cur.saturating_sub(1));
    });
}

/// RAII guard pairing `enable_ki_protection`/`disable_ki_protection`
/// around a scope, matching how the source always installs and tears
/// down its local flag together (`@enable_ki_protection` decorator).
pub struct KiProtectionGuard(());

impl KiProtectionGuard {
    pub fn enter() -> Self {
        enable_ki_protection();
        KiProtectionGuard(())
    }
}

impl Drop for KiProtectionGuard {
    fn drop(&mut self) {
        disable_ki_protection();
    }
}

/// The signal-to-flag bridge. `install` registers a `SIGINT` handler that
/// sets `flag`; the run loop samples it once per iteration and, if set,
/// either delivers to the main task's abort callback immediately (the
/// frame was unprotected) or defers (the frame was protected, so delivery
/// waits for the task's next suspension — §4.6).
pub struct KiBridge {
    flag: Arc<AtomicBool>,
    #[cfg(unix)]
    _registration: Option<signal_hook::iterator::Handle>,
}

impl KiBridge {
    /// Register the process-wide `SIGINT` flag. Returns `Err` only if the
    /// platform refuses to install the handler (e.g. it's already
    /// claimed by an incompatible registration); callers that don't need
    /// KI handling can skip installing a bridge entirely.
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT])?;
        let handle = signals.handle();
        let flag_for_thread = flag.clone();
        std::thread::spawn(move || {
            for _ in signals.forever() {
                flag_for_thread.store(true, Ordering::SeqCst);
            }
        });
        Ok(KiBridge {
            flag,
            _registration: Some(handle),
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(KiBridge {
            flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// True if a `SIGINT` has arrived since the last `take`.
    pub fn take_pending(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    /// A cloneable handle a test (or an embedder without real signal
    /// delivery) can use to simulate a keyboard interrupt.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}
