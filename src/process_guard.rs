//! Process lifecycle management for provider scripts
//!
//! Scripts run against real targets, so a script must never outlive the
//! operation that started it.
//!
//! # Rules
//! - Every script is spawned as the leader of its own process group
//! - Every live script PID is tracked in a global registry
//! - Timeouts kill the whole group: SIGTERM, a grace period, then SIGKILL
//! - If the engine process dies, children receive SIGTERM via `PR_SET_PDEATHSIG`

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry of running script PIDs (each one a process group leader)
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered child process PID {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered child process PID {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate every tracked process group.
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("Cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            debug!("No child processes to terminate");
            return;
        }

        info!("Terminating {} child process group(s)", self.pids.len());
        let pids: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                info!("All child processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        for &pid in &pids {
            if is_process_alive(pid) {
                warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
                signal_group_or_process(pid, Signal::SIGKILL);
            }
        }
        self.pids.clear();
        info!("Child process cleanup complete");
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID signals the whole group, so grandchildren are reached too
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

fn signal_group_or_process(pid: u32, signal: Signal) {
    if let Err(e) = send_signal_to_group(pid, signal) {
        debug!("Group {} signal {:?} failed ({}), signalling PID", pid, signal, e);
        if let Err(e) = send_signal(pid, signal) {
            debug!("Signal {:?} to PID {} failed: {}", signal, pid, e);
        }
    }
}

/// Alive means present and not a zombie
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // Field 3 of /proc/<pid>/stat is the state; Z and X are dead
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }
    true
}

/// Kill one process group: SIGTERM, wait up to `grace_period`, then SIGKILL.
///
/// Returns true if the group leader was gone before SIGKILL was needed.
pub fn terminate_group(pgid: u32, grace_period: Duration) -> bool {
    signal_group_or_process(pgid, Signal::SIGTERM);
    let start = Instant::now();
    while start.elapsed() < grace_period {
        if !is_process_alive(pgid) {
            debug!("Process group {} exited after SIGTERM", pgid);
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    if is_process_alive(pgid) {
        warn!("Process group {} ignored SIGTERM, sending SIGKILL", pgid);
        signal_group_or_process(pgid, Signal::SIGKILL);
        return false;
    }
    true
}

/// Terminates all registered children when dropped
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
    grace_period: Duration,
}

impl ProcessGuard {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            registry: ChildRegistry::global(),
            grace_period,
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, initiating cleanup");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(self.grace_period);
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handling.
///
/// The first signal calls `on_interrupt` (cooperative cancellation). Any
/// further signal terminates all child scripts and exits with `128 + signo`.
pub fn init_signal_handlers<F>(on_interrupt: F, grace_period: Duration) -> Result<(), std::io::Error>
where
    F: Fn() + Send + 'static,
{
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let received = AtomicUsize::new(0);

    std::thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                let name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "UNKNOWN",
                };
                if received.fetch_add(1, Ordering::SeqCst) == 0 {
                    warn!("Received {}, cancelling running work (signal again to force exit)", name);
                    on_interrupt();
                    continue;
                }

                error!("Received second {}, terminating child scripts", name);
                if let Ok(mut registry) = ChildRegistry::global().lock() {
                    registry.terminate_all(grace_period);
                }
                std::process::exit(128 + sig);
            }
        })?;

    Ok(())
}

/// Extension trait for `std::process::Command` to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that dies with us
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions (setpgid, prctl)
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}
