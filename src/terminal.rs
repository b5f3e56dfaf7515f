//! Terminal attachment for the restored process
//!
//! Either hands the caller's stdio straight through, or allocates a
//! pseudo-terminal, gives its slave side to the restored process and pumps
//! bytes between the master side and the caller's stdio.

use nix::pty::{openpty, OpenptyResult};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::container::Process;
use crate::error::{Error, Result};
use crate::signals;

/// How long release waits for console output to reach stdout.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub enum Terminal {
    /// The process uses the caller's stdio as is.
    Passthrough,
    Console(Console),
}

pub struct Console {
    master: File,
    /// The caller's terminal (stdin outside tests).
    host: BorrowedFd<'static>,
    /// Host termios to put back on release.
    saved: Option<Termios>,
    output: Option<OutputPump>,
}

/// The master to stdout copy thread.
struct OutputPump {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl Terminal {
    /// Wire up `process` stdio, allocating a console owned by `owner_uid`
    /// when a terminal is wanted.
    pub fn attach(wants_terminal: bool, process: &mut Process, owner_uid: u32) -> Result<Self> {
        if !wants_terminal {
            return Ok(Terminal::Passthrough);
        }

        let OpenptyResult { master, slave } =
            openpty(None, None).map_err(|e| Error::Terminal(format!("openpty: {}", e)))?;
        // gid -1 leaves the group alone.
        if unsafe { libc::fchown(slave.as_raw_fd(), owner_uid, libc::gid_t::MAX) } != 0 {
            return Err(Error::Terminal(format!(
                "chown console to {}: {}",
                owner_uid,
                io::Error::last_os_error()
            )));
        }

        process.stdin = Some(slave.try_clone()?);
        process.stdout = Some(slave.try_clone()?);
        process.stderr = Some(slave);

        // stdin stays open for the life of the process.
        let host = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
        let console = Console::start(master, host)?;
        if let Err(e) = console.resize() {
            log::debug!("Initial console resize failed: {}", e);
        }
        Ok(Terminal::Console(console))
    }

    /// Copy the caller's window size onto the console.
    pub fn resize(&self) -> Result<()> {
        match self {
            Terminal::Passthrough => Ok(()),
            Terminal::Console(console) => console.resize(),
        }
    }

    /// Restore the caller's terminal settings and flush console output.
    /// Safe to call repeatedly.
    pub fn release(&mut self) -> Result<()> {
        match self {
            Terminal::Passthrough => Ok(()),
            Terminal::Console(console) => console.release(),
        }
    }

    pub fn is_console(&self) -> bool {
        matches!(self, Terminal::Console(_))
    }
}

impl Console {
    fn start(master: OwnedFd, host: BorrowedFd<'static>) -> Result<Self> {
        let master = File::from(master);

        let saved = if unsafe { libc::isatty(host.as_raw_fd()) } == 1 {
            let saved =
                tcgetattr(host).map_err(|e| Error::Terminal(format!("tcgetattr: {}", e)))?;
            let mut raw = saved.clone();
            cfmakeraw(&mut raw);
            tcsetattr(host, SetArg::TCSANOW, &raw)
                .map_err(|e| Error::Terminal(format!("tcsetattr: {}", e)))?;
            Some(saved)
        } else {
            None
        };

        // From here on `Drop` puts the host terminal back.
        let mut console = Console {
            master,
            host,
            saved,
            output: None,
        };

        let mut output = console.master.try_clone()?;
        let (tx, done) = mpsc::channel();
        let handle = thread::spawn(move || {
            signals::block_forwarded();
            // EIO once every slave end is closed.
            if let Err(e) = io::copy(&mut output, &mut io::stdout()) {
                log::debug!("Console output closed: {}", e);
            }
            if let Err(e) = io::stdout().flush() {
                log::debug!("Flushing console output failed: {}", e);
            }
            let _ = tx.send(());
        });
        console.output = Some(OutputPump { handle, done });

        let mut input = console.master.try_clone()?;
        thread::spawn(move || {
            signals::block_forwarded();
            if let Err(e) = io::copy(&mut io::stdin(), &mut input) {
                log::debug!("Console input closed: {}", e);
            }
        });

        Ok(console)
    }

    fn resize(&self) -> Result<()> {
        let mut size: libc::winsize = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::ioctl(self.host.as_raw_fd(), libc::TIOCGWINSZ, &mut size) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        log::debug!("Console resized to {}x{}", size.ws_col, size.ws_row);
        Ok(())
    }

    /// Wait for the output thread to copy what the process left behind.
    ///
    /// Returns false when something still holds the slave open past
    /// [`DRAIN_TIMEOUT`]; the thread is then left to run detached.
    fn drain(&mut self) -> bool {
        let Some(pump) = self.output.take() else {
            return true;
        };
        match pump.done.recv_timeout(DRAIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if pump.handle.join().is_err() {
                    log::debug!("Console output thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log::debug!("Console still open after {:?}, not waiting", DRAIN_TIMEOUT);
                false
            }
        }
    }

    fn release(&mut self) -> Result<()> {
        if let Some(saved) = self.saved.take() {
            tcsetattr(self.host, SetArg::TCSANOW, &saved)
                .map_err(|e| Error::Terminal(format!("tcsetattr: {}", e)))?;
        }
        self.drain();
        Ok(())
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to release console: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::termios::LocalFlags;

    fn borrow(fd: &OwnedFd) -> BorrowedFd<'static> {
        // Callers keep `fd` open for as long as the console lives.
        unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) }
    }

    fn canonical(fd: &OwnedFd) -> bool {
        tcgetattr(fd)
            .unwrap()
            .local_flags
            .contains(LocalFlags::ICANON)
    }

    #[test]
    fn test_passthrough_leaves_stdio_inherited() {
        let mut process = Process::new(false);
        let mut terminal = Terminal::attach(false, &mut process, 0).unwrap();

        assert!(!terminal.is_console());
        assert!(process.stdin.is_none());
        assert!(process.stdout.is_none());
        assert!(process.stderr.is_none());
        assert!(terminal.resize().is_ok());
        assert!(terminal.release().is_ok());
    }

    #[test]
    fn test_dropping_console_restores_host_terminal() {
        let host = openpty(None, None).unwrap();
        let inner = openpty(None, None).unwrap();
        assert!(canonical(&host.slave));

        let console = Console::start(inner.master, borrow(&host.slave)).unwrap();
        assert!(!canonical(&host.slave));

        drop(inner.slave);
        drop(console);
        assert!(canonical(&host.slave));
    }

    #[test]
    fn test_release_waits_for_console_output() {
        let host = openpty(None, None).unwrap();
        let inner = openpty(None, None).unwrap();
        let mut console = Console::start(inner.master, borrow(&host.slave)).unwrap();

        let mut slave = File::from(inner.slave);
        slave.write_all(b"restored\r\n").unwrap();
        drop(slave);

        assert!(console.drain());
        assert!(console.output.is_none());
        console.release().unwrap();
    }

    #[test]
    #[ignore] // Needs /dev/ptmx and permission to chown the slave
    fn test_console_wires_slave_into_process() {
        let mut process = Process::new(true);
        let uid = nix::unistd::getuid().as_raw();
        let mut terminal = Terminal::attach(true, &mut process, uid).unwrap();

        assert!(terminal.is_console());
        let stdin = process.stdin.as_ref().unwrap();
        assert_eq!(unsafe { libc::isatty(stdin.as_raw_fd()) }, 1);
        process.close_stdio();
        terminal.release().unwrap();
    }
}
