use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use crate::error::{Error, Result};

/// A child process started stopped: it blocks before exec until
/// [`Workload::start`] is called, so event files opened with enable-on-exec
/// observe it from its first instruction.
pub struct Workload {
    child: Child,
    start_fd: Option<RawFd>,
}

impl Workload {
    pub fn spawn(args: &[String]) -> Result<Workload> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::InvalidConfig("empty workload command".into()))?;
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut command = Command::new(program);
        command.args(rest);
        unsafe {
            command.pre_exec(move || {
                // Wait for the parent's go-ahead (a write or close on the
                // other end) before exec.
                let mut byte = [0u8; 1];
                libc::read(read_fd, byte.as_mut_ptr() as *mut libc::c_void, 1);
                Ok(())
            });
        }
        let child = command.spawn().map_err(|err| Error::KernelOpen {
            name: program.clone(),
            source: err,
        })?;
        unsafe { libc::close(read_fd) };
        Ok(Workload {
            child,
            start_fd: Some(write_fd),
        })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.child.id() as libc::pid_t
    }

    /// Let the child proceed to exec.
    pub fn start(&mut self) -> Result<()> {
        if let Some(fd) = self.start_fd.take() {
            let byte = [1u8; 1];
            let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
            unsafe { libc::close(fd) };
            if n != 1 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    /// Nonblocking exit check; `Some(success)` once the child is gone.
    pub fn try_finished(&mut self) -> Option<bool> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.success()),
            Ok(None) => None,
            Err(_) => Some(false),
        }
    }
}

impl Drop for Workload {
    fn drop(&mut self) {
        // Stop a still-running child before touching the start gate, so a
        // never-started child cannot slip through exec unprofiled.
        if !matches!(self.child.try_wait(), Ok(Some(_))) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        if let Some(fd) = self.start_fd.take() {
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_runs_after_start() {
        let mut workload = Workload::spawn(&["true".to_string()]).unwrap();
        assert!(workload.pid() > 0);
        workload.start().unwrap();
        let success = loop {
            if let Some(success) = workload.try_finished() {
                break success;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        };
        assert!(success);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(Workload::spawn(&[]).is_err());
    }
}
