//! SIGPROF handler installation and delivery.
//!
//! The sampler worker drives on-GIL sampling by sending SIGPROF to the
//! process; the OS routes it to some unblocked thread, and the handler
//! only acts when that thread holds the GIL. The worker blocks SIGPROF on
//! its own thread so it never handles its own signals.

use crate::error::{ProfilingError, Result};

/// The signature sigaction expects for SA_SIGINFO handlers.
pub type SignalHandler =
    extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Install `handler` for SIGPROF.
///
/// If a foreign handler is already installed, it is put back and an error
/// is returned: silently stealing another component's profiling signal
/// would break it. Finding our own handler already installed is fine (it
/// can legitimately survive a fork).
pub fn install_sigprof_signal_handler(handler: SignalHandler) -> Result<()> {
    let mut signal_handler_config: libc::sigaction = unsafe { std::mem::zeroed() };
    signal_handler_config.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
    signal_handler_config.sa_sigaction = handler as usize;
    unsafe { libc::sigemptyset(&mut signal_handler_config.sa_mask) };

    let mut existing_config: libc::sigaction = unsafe { std::mem::zeroed() };

    if unsafe { libc::sigaction(libc::SIGPROF, &signal_handler_config, &mut existing_config) } != 0
    {
        return Err(ProfilingError::sampling_fault(
            "could not install SIGPROF signal handler",
        ));
    }

    if existing_config.sa_sigaction == handler as usize {
        return Ok(());
    }

    if existing_config.sa_sigaction != libc::SIG_DFL
        && existing_config.sa_sigaction != libc::SIG_IGN
    {
        // A pre-existing handler belongs to someone else; back out.
        if unsafe { libc::sigaction(libc::SIGPROF, &existing_config, std::ptr::null_mut()) } != 0 {
            return Err(ProfilingError::sampling_fault(
                "could not re-install pre-existing SIGPROF handler; it may now be broken",
            ));
        }
        return Err(ProfilingError::sampling_fault(
            "there's a pre-existing SIGPROF signal handler",
        ));
    }

    Ok(())
}

/// Reset SIGPROF back to its default disposition.
///
/// Goes through SIG_IGN first: that discards any still-pending SIGPROF the
/// trigger loop sent just before stopping, which under SIG_DFL would
/// terminate the process.
pub fn remove_sigprof_signal_handler() -> Result<()> {
    let mut signal_handler_config: libc::sigaction = unsafe { std::mem::zeroed() };
    signal_handler_config.sa_flags = libc::SA_RESTART;
    signal_handler_config.sa_sigaction = libc::SIG_IGN;
    unsafe { libc::sigemptyset(&mut signal_handler_config.sa_mask) };

    if unsafe { libc::sigaction(libc::SIGPROF, &signal_handler_config, std::ptr::null_mut()) } != 0
    {
        return Err(ProfilingError::sampling_fault(
            "failure while removing the SIGPROF signal handler",
        ));
    }

    signal_handler_config.sa_sigaction = libc::SIG_DFL;
    if unsafe { libc::sigaction(libc::SIGPROF, &signal_handler_config, std::ptr::null_mut()) } != 0
    {
        return Err(ProfilingError::sampling_fault(
            "failure while removing the SIGPROF signal handler",
        ));
    }
    Ok(())
}

/// Block SIGPROF delivery on the calling thread.
pub fn block_sigprof_signal_handler_from_running_in_current_thread() {
    unsafe {
        let mut signals_to_block: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut signals_to_block);
        libc::sigaddset(&mut signals_to_block, libc::SIGPROF);
        libc::pthread_sigmask(libc::SIG_BLOCK, &signals_to_block, std::ptr::null_mut());
    }
}

/// Send SIGPROF to the process; the kernel picks a thread that has not
/// blocked it.
pub fn send_sigprof_to_process() {
    unsafe {
        libc::kill(libc::getpid(), libc::SIGPROF);
    }
}

/// Whether `handler` is the currently installed SIGPROF handler. Testing
/// hook.
pub fn current_handler_is(handler: SignalHandler) -> bool {
    let mut existing_config: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(libc::SIGPROF, std::ptr::null(), &mut existing_config) } != 0 {
        return false;
    }
    existing_config.sa_sigaction == handler as usize
}
