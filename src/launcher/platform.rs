//! Per-platform "please stop" delivery.
//!
//! Unix gets SIGTERM. Windows children are started in their own process
//! group so they can be sent CTRL_BREAK without hitting the supervisor.
//! Anything else falls back to a hard kill.

use std::io;
use tokio::process::{Child, Command};

/// Adjust a long-running child's command so it can later receive
/// [`request_graceful_stop`].
#[cfg(windows)]
pub fn prepare(cmd: &mut Command) {
    use windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(windows))]
pub fn prepare(_cmd: &mut Command) {}

/// Ask `child` to shut down on its own. A child that was already reaped is
/// left alone.
#[cfg(unix)]
pub fn request_graceful_stop(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)?;
    Ok(())
}

#[cfg(windows)]
pub fn request_graceful_stop(child: &mut Child) -> io::Result<()> {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

    let Some(pid) = child.id() else {
        return Ok(());
    };
    // SAFETY: plain FFI call with a process group id we created.
    let ok = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub fn request_graceful_stop(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[tokio::test]
    async fn sigterm_stops_a_sleeping_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        prepare(&mut cmd);
        let mut child = cmd.spawn().unwrap();

        request_graceful_stop(&mut child).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(nix::libc::SIGTERM));
    }

    #[tokio::test]
    async fn reaped_child_is_a_noop() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        assert!(request_graceful_stop(&mut child).is_ok());
    }
}
