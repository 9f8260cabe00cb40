//! Interrupt handling around a server launch.
//!
//! Between spawning a server and committing its record, the supervisor is the
//! only thing that knows the server exists. If SIGINT, SIGTERM or SIGHUP ends
//! the invocation inside that window, the handler installed here kills and
//! reaps the tracked child first, then lets the signal terminate the
//! supervisor as it normally would.
//!
//! `InterruptGuard` owns the handlers; the launcher reports the child with
//! [`track`] while signals are held back by [`hold_signals`], so a signal
//! arriving during `fork` is delivered only once the pid is known. Whoever
//! commits the record calls [`untrack`].

use crate::core::error::VisorError;

#[cfg(unix)]
mod imp {
    use super::VisorError;
    use nix::libc;
    use nix::sys::signal::{
        SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask, raise,
        sigaction, signal,
    };
    use nix::sys::wait::waitpid;
    use nix::unistd::Pid;
    use std::sync::atomic::{AtomicI32, Ordering};

    const WATCHED: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

    /// Pid of the server whose record is not committed yet; 0 when none.
    static TRACKED: AtomicI32 = AtomicI32::new(0);

    extern "C" fn on_interrupt(signum: libc::c_int) {
        // Only async-signal-safe calls from here on.
        let pid = TRACKED.swap(0, Ordering::SeqCst);
        if pid > 0 {
            let child = Pid::from_raw(pid);
            let _ = nix::sys::signal::kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
        }
        if let Ok(sig) = Signal::try_from(signum) {
            // SAFETY: restoring the default disposition is async-signal-safe.
            unsafe {
                let _ = signal(sig, SigHandler::SigDfl);
            }
            let _ = raise(sig);
        }
    }

    pub struct InterruptGuard {
        previous: Vec<(Signal, SigAction)>,
    }

    impl InterruptGuard {
        pub fn install() -> Result<Self, VisorError> {
            let action = SigAction::new(
                SigHandler::Handler(on_interrupt),
                SaFlags::empty(),
                SigSet::empty(),
            );
            let mut guard = InterruptGuard {
                previous: Vec::with_capacity(WATCHED.len()),
            };
            for sig in WATCHED {
                // SAFETY: the handler only uses async-signal-safe calls.
                let old = unsafe { sigaction(sig, &action) }.map_err(std::io::Error::from)?;
                let ignored = old.handler() == SigHandler::SigIgn;
                guard.previous.push((sig, old));
                if ignored {
                    // Ignored on purpose (nohup): keep it that way.
                    unsafe {
                        let _ = sigaction(sig, &guard.previous[guard.previous.len() - 1].1);
                    }
                }
            }
            Ok(guard)
        }
    }

    impl Drop for InterruptGuard {
        fn drop(&mut self) {
            for (sig, old) in self.previous.iter().rev() {
                // SAFETY: reinstates the disposition that was in place before `install`.
                unsafe {
                    let _ = sigaction(*sig, old);
                }
            }
        }
    }

    pub fn track(pid: u32) {
        if let Ok(pid) = i32::try_from(pid) {
            TRACKED.store(pid, Ordering::SeqCst);
        }
    }

    pub fn untrack(pid: u32) {
        if let Ok(pid) = i32::try_from(pid) {
            let _ = TRACKED.compare_exchange(pid, 0, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    pub fn tracked() -> Option<u32> {
        u32::try_from(TRACKED.load(Ordering::SeqCst))
            .ok()
            .filter(|pid| *pid > 0)
    }

    pub struct SignalHold {
        previous: SigSet,
    }

    pub fn hold_signals() -> Result<SignalHold, VisorError> {
        let mut set = SigSet::empty();
        for sig in WATCHED {
            set.add(sig);
        }
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))
            .map_err(std::io::Error::from)?;
        Ok(SignalHold { previous })
    }

    impl Drop for SignalHold {
        fn drop(&mut self) {
            let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::VisorError;

    pub struct InterruptGuard;

    impl InterruptGuard {
        pub fn install() -> Result<Self, VisorError> {
            Ok(InterruptGuard)
        }
    }

    pub fn track(_pid: u32) {}

    pub fn untrack(_pid: u32) {}

    pub fn tracked() -> Option<u32> {
        None
    }

    pub struct SignalHold;

    pub fn hold_signals() -> Result<SignalHold, VisorError> {
        Ok(SignalHold)
    }
}

/// Kills the tracked server if the supervisor is interrupted; restores the
/// previous signal dispositions when dropped.
pub use imp::InterruptGuard;
/// Blocks the watched signals on this thread until dropped.
pub use imp::SignalHold;
pub use imp::{hold_signals, track, tracked, untrack};
