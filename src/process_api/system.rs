use std::sync::{Mutex, MutexGuard};

use sysinfo::{get_current_pid, Pid, Process, ProcessStatus, ProcessesToUpdate, System, Users};
use tracing::{instrument, warn};

use super::{ProcessIdentity, ProcessInspector, ProcessListing, ProcessTarget};

/// [ProcessInspector] backed by `sysinfo`. Refreshes only what a call needs, so liveness checks
/// of a single pid stay cheap.
pub struct SystemInspector {
    system: Mutex<System>,
    own_pid: Option<Pid>,
}

impl SystemInspector {
    pub fn new() -> Self {
        let own_pid = get_current_pid()
            .inspect_err(|e| warn!("Couldn't determine own pid: {e}"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            own_pid,
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SystemInspector {
    fn default() -> Self {
        Self::new()
    }
}

/// Zombies and threads are not something a user would want to track.
fn is_trackable(process: &Process) -> bool {
    process.thread_kind().is_none()
        && !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn to_identity(pid: Pid, process: &Process) -> ProcessIdentity {
    ProcessIdentity {
        pid: pid.as_u32(),
        name: process.name().to_string_lossy().into(),
        start_time: Some(process.start_time()),
    }
}

impl ProcessInspector for SystemInspector {
    #[instrument(skip(self))]
    fn find(&self, target: &ProcessTarget) -> Vec<ProcessIdentity> {
        let mut system = self.system();
        match target {
            ProcessTarget::Pid(pid) => {
                let pid = Pid::from_u32(*pid);
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                system
                    .process(pid)
                    .filter(|process| is_trackable(process))
                    .map(|process| to_identity(pid, process))
                    .into_iter()
                    .collect()
            }
            ProcessTarget::Name(name) => {
                system.refresh_processes(ProcessesToUpdate::All, true);
                system
                    .processes()
                    .iter()
                    .filter(|(_, process)| is_trackable(process))
                    .filter(|(_, process)| {
                        process.name().to_string_lossy().eq_ignore_ascii_case(name)
                    })
                    .map(|(pid, process)| to_identity(*pid, process))
                    .collect()
            }
        }
    }

    fn is_alive(&self, identity: &ProcessIdentity) -> bool {
        let pid = Pid::from_u32(identity.pid);
        let mut system = self.system();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) if is_trackable(process) => match identity.start_time {
                Some(start_time) => process.start_time() == start_time,
                None => true,
            },
            _ => false,
        }
    }

    fn is_self(&self, pid: u32) -> bool {
        self.own_pid.is_some_and(|own| own.as_u32() == pid)
    }

    fn list(&self) -> Vec<ProcessListing> {
        let mut system = self.system();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let users = Users::new_with_refreshed_list();

        let mut listing = system
            .processes()
            .iter()
            .filter(|(_, process)| is_trackable(process))
            .map(|(pid, process)| ProcessListing {
                user: process
                    .user_id()
                    .and_then(|uid| users.get_user_by_id(uid))
                    .map(|user| user.name().to_string()),
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().to_string(),
            })
            .collect::<Vec<_>>();
        listing.sort_by_key(|v| v.pid);
        listing
    }
}
