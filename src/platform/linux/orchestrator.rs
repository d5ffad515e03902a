use std::ffi::CString;
use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid, Uid};
use tracing::{debug, error, info, warn};

use crate::core::error::{MiniconError, Result};
use crate::platform::linux::cgroups::CgroupController;
use crate::platform::linux::handlers::{MountHandler, PidHandler, UserHandler, UtsHandler};
use crate::platform::linux::namespaces::IdMapping;

/// How long `terminate` waits after SIGTERM before escalating to SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// Poll interval for the grace window and for adopted processes.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State shared between the caller thread and the monitor thread. The lock
/// is only ever held for field access, never across a blocking wait.
#[derive(Debug, Default)]
struct RunState {
    pid: Option<Pid>,
    cgroup: Option<CgroupController>,
}

/// Sequences everything order-sensitive about bringing a container up:
/// unshare in the parent, cgroup pre-creation, fork, UID/GID map
/// installation, cgroup attachment, the sync-pipe release, and the exec in
/// the child. Also owns teardown: waiting, terminating, cgroup cleanup.
#[derive(Debug)]
pub struct Orchestrator {
    mount: Option<MountHandler>,
    uts: Option<UtsHandler>,
    pid_ns: PidHandler,
    user: UserHandler,
    command: Option<Vec<String>>,
    memory_limit: Option<u64>,
    user_ns_active: bool,
    run: Mutex<RunState>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            mount: None,
            uts: None,
            pid_ns: PidHandler,
            user: UserHandler::new(),
            command: None,
            memory_limit: None,
            user_ns_active: false,
            run: Mutex::new(RunState::default()),
        }
    }

    /// Shell orchestrator for a container recovered after a runtime restart:
    /// it only knows the PID and can wait on it and clean up.
    pub fn adopt(pid: i32) -> Self {
        let mut orchestrator = Self::new();
        orchestrator.run.get_mut().unwrap().pid = Some(Pid::from_raw(pid));
        orchestrator
    }

    /// Record the container's filesystem, hostname, command, memory limit
    /// and user-namespace mappings. Must run before
    /// [`Self::create_container_process`].
    pub fn configure(
        &mut self,
        root_fs: &Path,
        hostname: &str,
        command: &[String],
        memory_limit: u64,
        uid_map: &[IdMapping],
        gid_map: &[IdMapping],
    ) {
        self.mount = Some(MountHandler::new(root_fs));
        self.uts = Some(UtsHandler::new(hostname));
        self.command = Some(command.to_vec());
        self.memory_limit = Some(memory_limit);

        for mapping in uid_map {
            self.user.add_uid_mapping(*mapping);
        }
        for mapping in gid_map {
            self.user.add_gid_mapping(*mapping);
        }
        if let (Some(uid), Some(gid)) = (uid_map.first(), gid_map.first()) {
            self.user.set_user(uid.inside, gid.inside);
        }

        debug!(
            root_fs = %root_fs.display(),
            hostname,
            ?command,
            memory_limit,
            "orchestrator configured"
        );
    }

    pub fn set_cgroup_settings(&mut self, memory_limit: u64) {
        self.memory_limit = Some(memory_limit);
    }

    pub fn container_pid(&self) -> Option<i32> {
        self.run.lock().unwrap().pid.map(Pid::as_raw)
    }

    /// Create the container process and return its host-visible PID.
    ///
    /// Ordering here is load-bearing: namespaces are unshared in the parent
    /// (the next fork lands the child in the new PID namespace as PID 1),
    /// the cgroup exists with its limit before the child does, and the child
    /// blocks on the pipe until the parent has installed the UID/GID maps
    /// and the cgroup attachment.
    pub fn create_container_process(&mut self) -> Result<i32> {
        let command = self
            .command
            .clone()
            .ok_or_else(|| MiniconError::Validation("command not set, call configure first".into()))?;

        self.setup_namespaces()?;
        self.precreate_cgroup();

        let (read_fd, write_fd) = nix::unistd::pipe().map_err(|e| MiniconError::kernel("pipe", e))?;
        // Raw fds from here on: OwnedFd drop semantics do not survive fork.
        let read_raw = read_fd.into_raw_fd();
        let write_raw = write_fd.into_raw_fd();

        // SAFETY: the child only runs namespace finalization and then execs
        // or _exits; it never returns into this function.
        match unsafe { fork() }.map_err(|e| MiniconError::kernel("fork", e))? {
            ForkResult::Parent { child } => {
                unsafe { libc::close(read_raw) };
                self.run.lock().unwrap().pid = Some(child);
                self.release_child(child, write_raw);
                info!(pid = child.as_raw(), "container process created");
                Ok(child.as_raw())
            }
            ForkResult::Child => {
                unsafe { libc::close(write_raw) };
                // Block until the parent signals; EOF means the parent died
                // and we proceed straight to the exec attempt.
                let mut buf = [0u8; 2];
                unsafe { libc::read(read_raw, buf.as_mut_ptr().cast(), buf.len()) };
                unsafe { libc::close(read_raw) };

                if let Err(e) = self.enter_container(&command) {
                    error!(error = %e, "container process setup failed");
                }
                unsafe { libc::_exit(1) }
            }
        }
    }

    /// Parent half of the namespace setup, run before the fork. Root skips
    /// the user namespace: privilege elevation and user namespaces interact
    /// badly, so in root mode the container simply keeps running as root.
    fn setup_namespaces(&mut self) -> Result<()> {
        self.user_ns_active = !Uid::effective().is_root();
        if self.user_ns_active {
            self.user.setup()?;
        } else {
            debug!("running as root, skipping user namespace");
        }

        let mount = self
            .mount
            .as_ref()
            .ok_or_else(|| MiniconError::Internal("orchestrator not configured".into()))?;
        let uts = self
            .uts
            .as_ref()
            .ok_or_else(|| MiniconError::Internal("orchestrator not configured".into()))?;

        mount.setup()?;
        uts.setup()?;
        self.pid_ns.setup()?;
        Ok(())
    }

    /// Pre-create the memory cgroup so the limit binds from the child's
    /// first allocation. Unavailable cgroups are tolerated.
    fn precreate_cgroup(&self) {
        let Some(limit) = self.memory_limit else {
            debug!("no memory limit set, skipping cgroup setup");
            return;
        };
        match CgroupController::create(limit) {
            Ok(cgroup) => self.run.lock().unwrap().cgroup = Some(cgroup),
            Err(e) => warn!(error = %e, "starting container without memory enforcement"),
        }
    }

    /// Parent side after fork: install UID/GID maps, attach the child to the
    /// cgroup, then write the go signal and close the pipe.
    fn release_child(&self, child: Pid, write_raw: i32) {
        if self.user_ns_active {
            if let Err(e) = self.user.apply_from_parent(child) {
                warn!(error = %e, "could not install UID/GID mappings");
            }
        }

        if let Some(cgroup) = &self.run.lock().unwrap().cgroup {
            if let Err(e) = cgroup.attach(child) {
                warn!(error = %e, "could not attach container to cgroup");
            }
        }

        let go = b"go";
        let written = unsafe { libc::write(write_raw, go.as_ptr().cast(), go.len()) };
        if written != go.len() as isize {
            warn!("short write on synchronization pipe");
        }
        unsafe { libc::close(write_raw) };
    }

    /// Child side after the pipe releases: finalize isolation, drop
    /// privileges, exec. Never returns on success.
    fn enter_container(&self, command: &[String]) -> Result<()> {
        if let Some(mount) = &self.mount {
            mount.apply()?;
        }
        if let Some(uts) = &self.uts {
            uts.apply()?;
        }
        if self.user_ns_active && self.user.target_user().is_some() {
            self.user.drop_privileges()?;
        }

        let program = CString::new(command[0].as_str())
            .map_err(|_| MiniconError::Validation(format!("invalid command: {:?}", command[0])))?;
        let args: Vec<CString> = command
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| MiniconError::Validation("command contains NUL byte".into()))?;

        nix::unistd::execvp(&program, &args).map_err(|e| MiniconError::kernel("execvp", e))?;
        unreachable!("execvp replaced the process image");
    }

    /// Block until the container process exits and return its exit code:
    /// `WEXITSTATUS` on normal exit, `128 + signal` when signalled, `-1`
    /// otherwise. Resources are cleaned up before returning.
    pub fn wait_for_exit(&self) -> Result<i32> {
        let pid = self
            .run
            .lock()
            .unwrap()
            .pid
            .ok_or_else(|| MiniconError::Internal("container process not created".into()))?;

        debug!(pid = pid.as_raw(), "waiting for container process");
        let exit_code = loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break code,
                Ok(WaitStatus::Signaled(_, signal, _)) => break 128 + signal as i32,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // Adopted after a restart (not our child), or another
                    // thread already reaped it. Fall back to liveness polls.
                    wait_until_gone(pid);
                    break -1;
                }
                Err(e) => {
                    self.cleanup_resources();
                    return Err(MiniconError::kernel("waitpid", e));
                }
            }
        };

        info!(pid = pid.as_raw(), exit_code, "container process exited");
        self.cleanup_resources();
        Ok(exit_code)
    }

    /// Terminate the container: SIGTERM, up to a 5-second grace window,
    /// then SIGKILL. A process that is already gone counts as success.
    pub fn terminate(&self) -> Result<()> {
        let Some(pid) = self.run.lock().unwrap().pid else {
            return Ok(());
        };

        info!(pid = pid.as_raw(), "terminating container process");
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!(pid = pid.as_raw(), "container process already terminated");
                self.cleanup_resources();
                return Ok(());
            }
            Err(e) => {
                self.cleanup_resources();
                return Err(MiniconError::kernel("kill", e));
            }
        }

        if !self.reap_within_grace(pid) {
            warn!(
                pid = pid.as_raw(),
                "container did not terminate within grace period, sending SIGKILL"
            );
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    warn!(error = %e, "SIGKILL failed");
                }
            }
            match waitpid(pid, None) {
                Ok(_) | Err(Errno::ECHILD) => {}
                Err(e) => warn!(error = %e, "could not reap killed container"),
            }
        }

        self.cleanup_resources();
        Ok(())
    }

    /// Poll non-blockingly for the child to be reaped, up to the grace
    /// window. `ECHILD` means the monitor thread won the reap.
    fn reap_within_grace(&self, pid: Pid) -> bool {
        let deadline = Instant::now() + TERMINATE_GRACE;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Ok(_) | Err(Errno::ECHILD) => return true,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "waitpid during grace period failed");
                    return true;
                }
            }
        }
    }

    /// Remove the container's cgroup and forget its PID.
    pub fn cleanup_resources(&self) {
        let cgroup = {
            let mut run = self.run.lock().unwrap();
            run.pid = None;
            run.cgroup.take()
        };
        if let Some(cgroup) = cgroup {
            if let Err(e) = cgroup.cleanup() {
                warn!(error = %e, "cgroup cleanup failed");
            }
        }
    }
}

/// Poll `kill(pid, 0)` until the process disappears.
fn wait_until_gone(pid: Pid) {
    while kill(pid, None).is_ok() {
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn create_without_configure_is_rejected() {
        let mut orchestrator = Orchestrator::new();
        let err = orchestrator.create_container_process().unwrap_err();
        assert!(matches!(err, MiniconError::Validation(_)));
    }

    #[test]
    fn adopt_records_pid() {
        let orchestrator = Orchestrator::adopt(4242);
        assert_eq!(orchestrator.container_pid(), Some(4242));
    }

    #[test]
    fn wait_for_exit_without_process_errors() {
        let orchestrator = Orchestrator::new();
        assert!(orchestrator.wait_for_exit().is_err());
    }

    #[test]
    fn terminate_without_process_is_ok() {
        let orchestrator = Orchestrator::new();
        orchestrator.terminate().unwrap();
    }

    #[test]
    fn wait_for_exit_reaps_adopted_child() {
        let child = Command::new("true").spawn().unwrap();
        let orchestrator = Orchestrator::adopt(child.id() as i32);
        let code = orchestrator.wait_for_exit().unwrap();
        assert_eq!(code, 0);
        assert_eq!(orchestrator.container_pid(), None);
    }

    #[test]
    fn terminate_kills_adopted_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let orchestrator = Orchestrator::adopt(child.id() as i32);
        orchestrator.terminate().unwrap();
        assert!(kill(Pid::from_raw(child.id() as i32), None).is_err());
    }

    #[test]
    fn terminate_tolerates_already_dead_process() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        let orchestrator = Orchestrator::adopt(pid);
        orchestrator.terminate().unwrap();
    }
}
