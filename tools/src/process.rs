//! Subprocess lifecycle helpers for shell tools.

use std::io;

use tokio::process::{Child, Command};

/// RAII guard that kills a child process (and its process group on Unix) on drop.
///
/// Wrap a spawned child immediately after `spawn()` so a timeout or a cancelled
/// turn never leaves the command running. Call `disarm()` once the process
/// has exited normally.
pub struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    #[must_use]
    pub fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    pub fn child_mut(&mut self) -> &mut Child {
        self.child.as_mut().expect("child present")
    }

    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn disarm(&mut self) {
        self.child = None;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        #[cfg(unix)]
        {
            let killed = child
                .id()
                .is_some_and(|pid| kill_process_group(pid).is_ok());
            if !killed {
                let _ = child.start_kill();
            }
            let _ = child.try_wait();
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
            let _ = child.try_wait();
        }
    }
}

/// Send SIGKILL to the process group led by `pid`.
///
/// Shell tools start their commands in a new session, so the shell's pid is
/// also the group id and this reaches every process the command spawned.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> io::Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Start the command in its own session, tied to our lifetime.
///
/// On Linux the child is also sent SIGKILL if mcode dies, so a crash never
/// orphans a runaway build or test run.
#[cfg(unix)]
pub fn set_new_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: the closure only calls async-signal-safe libc functions.
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Start the command in its own session that outlives mcode.
#[cfg(unix)]
pub fn set_detached_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: the closure only calls async-signal-safe libc functions.
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn set_new_session(_cmd: &mut Command) {}

#[cfg(not(unix))]
pub fn set_detached_session(_cmd: &mut Command) {}
