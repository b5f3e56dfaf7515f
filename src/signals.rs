//! Signal forwarding and reaping for the restored process
//!
//! The supervisor makes this process a child subreaper, so the detached
//! process tree CRIU restores is reparented to us, and blocks the signals it
//! handles so they queue up for [`Supervisor::forward`]. That loop reaps
//! exited children, resizes the console on SIGWINCH and relays everything
//! else to the restored process group until the restored init exits.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgid, getpgrp, Pid};

use crate::container::Process;
use crate::error::{Error, Result};
use crate::terminal::Terminal;

/// How long one wait for a signal lasts before children are polled again.
const WAIT_SLICE_NS: libc::c_long = 100_000_000;

/// Supervises one restored process. Closed exactly once by its owner.
pub trait Supervisor {
    /// Relay signals until the restored process exits; returns its exit code.
    fn forward(&mut self, process: &Process) -> Result<i32>;

    /// Stop supervising and release the terminal.
    fn close(&mut self) -> Result<()>;
}

/// Starts supervisors.
pub trait SupervisorFactory {
    fn start(&self, terminal: Terminal) -> Result<Box<dyn Supervisor>>;
}

/// Supervisors driven by real host signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSignals;

impl SupervisorFactory for HostSignals {
    fn start(&self, terminal: Terminal) -> Result<Box<dyn Supervisor>> {
        Ok(Box::new(SignalSupervisor::new(terminal)?))
    }
}

/// Signals whose default action is to kill or stop us but which are not
/// caused by our own faults. SIGKILL and SIGSTOP cannot be caught at all.
fn handled_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in Signal::iterator() {
        if !matches!(
            signal,
            Signal::SIGKILL
                | Signal::SIGSTOP
                | Signal::SIGSEGV
                | Signal::SIGBUS
                | Signal::SIGILL
                | Signal::SIGFPE
                | Signal::SIGTRAP
                | Signal::SIGSYS
        ) {
            set.add(signal);
        }
    }
    set
}

/// Whether `signal` is relayed to the restored process rather than handled
/// here.
pub fn is_forwarded(signal: Signal) -> bool {
    handled_signals().contains(signal) && !matches!(signal, Signal::SIGCHLD | Signal::SIGWINCH)
}

/// Block the handled signals in the calling thread so they are only ever
/// taken by the supervisor.
pub fn block_forwarded() {
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&handled_signals()), None) {
        log::warn!("Failed to block signals in helper thread: {}", e);
    }
}

/// Exit code for a terminated child, shell style.
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

pub struct SignalSupervisor {
    mask: SigSet,
    previous: Option<SigSet>,
    terminal: Option<Terminal>,
    closed: bool,
}

fn set_child_subreaper(enabled: bool) -> Result<()> {
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_CHILD_SUBREAPER,
            libc::c_ulong::from(enabled),
            0,
            0,
            0,
        )
    };
    if ret != 0 {
        return Err(Error::Supervisor(format!(
            "cannot {} child subreaper: {}",
            if enabled { "become" } else { "stop being" },
            Errno::last()
        )));
    }
    Ok(())
}

impl SignalSupervisor {
    /// Subscribe to host signals. Does not block.
    pub fn new(terminal: Terminal) -> Result<Self> {
        set_child_subreaper(true)?;

        let mask = handled_signals();
        let mut previous = SigSet::empty();
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut previous)) {
            if let Err(e) = set_child_subreaper(false) {
                log::warn!("{}", e);
            }
            return Err(e.into());
        }

        Ok(SignalSupervisor {
            mask,
            previous: Some(previous),
            terminal: Some(terminal),
            closed: false,
        })
    }

    /// Reap every exited child; returns the exit code if `target` was one.
    fn reap(&self, target: Pid) -> Result<Option<i32>> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    let Some(pid) = status.pid() else {
                        return Ok(None);
                    };
                    match exit_code(status) {
                        Some(code) if pid == target => {
                            log::debug!("Process {} exited with {}", pid, code);
                            return Ok(Some(code));
                        }
                        Some(code) => log::debug!("Reaped child {} ({})", pid, code),
                        None => {}
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    return Err(Error::Supervisor(format!(
                        "process {} is not a child of this supervisor",
                        target
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait a bounded time for one of the handled signals.
    fn next_signal(&self) -> Result<Option<Signal>> {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: WAIT_SLICE_NS,
        };
        let ret = unsafe { libc::sigtimedwait(self.mask.as_ref(), &mut info, &timeout) };
        if ret < 0 {
            return match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => Ok(None),
                e => Err(e.into()),
            };
        }
        Ok(Signal::try_from(ret).ok())
    }

    fn deliver(&self, target: Pid, signal: Signal) {
        // Signal the whole group unless it is ours.
        let result = match getpgid(Some(target)) {
            Ok(group) if group != getpgrp() => killpg(group, signal),
            _ => kill(target, signal),
        };
        match result {
            Ok(()) => log::debug!("Forwarded {:?} to {}", signal, target),
            Err(Errno::ESRCH) => log::debug!("{} gone before {:?} arrived", target, signal),
            Err(e) => log::warn!("Failed to forward {:?} to {}: {}", signal, target, e),
        }
    }
}

impl Supervisor for SignalSupervisor {
    fn forward(&mut self, process: &Process) -> Result<i32> {
        let target = process
            .pid
            .ok_or_else(|| Error::Supervisor("restored process has no pid".to_string()))?;
        log::debug!(
            "Supervising process {}{}",
            target,
            match &self.terminal {
                Some(terminal) if terminal.is_console() => " on a console",
                _ => "",
            }
        );

        loop {
            if let Some(code) = self.reap(target)? {
                return Ok(code);
            }
            match self.next_signal()? {
                None | Some(Signal::SIGCHLD) => {}
                Some(Signal::SIGWINCH) => {
                    if let Some(terminal) = &self.terminal {
                        if let Err(e) = terminal.resize() {
                            log::debug!("Console resize failed: {}", e);
                        }
                    }
                }
                Some(signal) if is_forwarded(signal) => self.deliver(target, signal),
                Some(_) => {}
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut result = set_child_subreaper(false);
        if let Some(previous) = self.previous.take() {
            if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None) {
                result = Err(e.into());
            }
        }
        if let Some(mut terminal) = self.terminal.take() {
            terminal.release()?;
        }
        result
    }
}

impl Drop for SignalSupervisor {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.close() {
            log::warn!("Failed to close signal supervisor: {}", e);
        }
    }
}
