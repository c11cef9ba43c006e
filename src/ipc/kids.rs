//! Registry of child processes (workers, diskers, coordinator) with the
//! restart/revival policy applied by the master process.

use nix::unistd::Pid;

use crate::utils::clock;

/// Exits faster than this count as "bad" failures.
const FAST_FAILURE_TIME_LIMIT: i64 = 10;
/// Bad failures tolerated before a kid is declared hopeless.
const BAD_FAILURE_LIMIT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KidRole {
    Worker,
    Disker,
    Coordinator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

#[derive(Debug, Clone)]
pub struct Kid {
    name: String,
    role: KidRole,
    pid: Option<Pid>,
    start_time: i64,
    stop_time: i64,
    bad_failures: u32,
    status: Option<ExitStatus>,
}

impl Kid {
    fn new(name: String, role: KidRole) -> Kid {
        Kid {
            name,
            role,
            pid: None,
            start_time: 0,
            stop_time: 0,
            bad_failures: 0,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> KidRole {
        self.role
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn started(&mut self, pid: Pid) {
        self.pid = Some(pid);
        self.start_time = clock::current_time();
        self.status = None;
    }

    /// Record a death reported by waitpid.
    pub fn stopped(&mut self, status: ExitStatus) {
        let now = clock::current_time();
        if now - self.start_time < FAST_FAILURE_TIME_LIMIT {
            self.bad_failures += 1;
        }
        self.stop_time = now;
        self.pid = None;
        self.status = Some(status);
    }

    pub fn running(&self) -> bool {
        self.pid.is_some()
    }

    pub fn exited_happy(&self) -> bool {
        matches!(self.status, Some(ExitStatus::Exited(0)))
    }

    pub fn signaled(&self, sig: i32) -> bool {
        matches!(self.status, Some(ExitStatus::Signaled(s)) if s == sig)
    }

    /// Crashed too often within the window; excluded from restart until the
    /// revival delay elapses.
    pub fn hopeless(&self) -> bool {
        self.bad_failures > BAD_FAILURE_LIMIT
    }

    pub fn should_restart(&self) -> bool {
        !self.running() && !self.exited_happy() && !self.hopeless()
    }

    /// Seconds since this kid died. Guards against clock steps.
    pub fn death_duration(&self) -> i64 {
        (clock::current_time() - self.stop_time).max(0)
    }

    pub fn forget_failures(&mut self) {
        self.bad_failures = 0;
    }
}

#[derive(Default)]
pub struct Kids {
    storage: Vec<Kid>,
}

impl Kids {
    pub fn new() -> Kids {
        Kids::default()
    }

    /// Build the roster: `workers` normal workers, one disker per cache
    /// directory, plus a coordinator when coordination is needed.
    pub fn init(&mut self, workers: usize, diskers: usize) {
        self.storage.clear();
        self.storage.reserve(workers + diskers + 1);
        for _ in 0..workers {
            self.storage.push(Kid::new(
                format!("kestrel-{}", self.storage.len() + 1),
                KidRole::Worker,
            ));
        }
        for _ in 0..diskers {
            self.storage.push(Kid::new(
                format!("kestrel-disk-{}", self.storage.len() + 1),
                KidRole::Disker,
            ));
        }
        if self.storage.len() > 1 {
            self.storage.push(Kid::new(
                format!("kestrel-coord-{}", self.storage.len() + 1),
                KidRole::Coordinator,
            ));
        }
    }

    /// Returns kid by pid.
    pub fn find(&mut self, pid: Pid) -> Option<&mut Kid> {
        self.storage.iter_mut().find(|k| k.pid == Some(pid))
    }

    /// Returns the kid by index, useful for kids iteration.
    pub fn get(&mut self, i: usize) -> &mut Kid {
        &mut self.storage[i]
    }

    pub fn count(&self) -> usize {
        self.storage.len()
    }

    /// Whether all kids are hopeless.
    pub fn all_hopeless(&self) -> bool {
        self.storage.iter().all(Kid::hopeless)
    }

    pub fn forget_all_failures(&mut self) {
        for kid in &mut self.storage {
            kid.forget_failures();
        }
    }

    /// Revive hopeless kids whose penalty has been served. Returns the
    /// delay until the next kid becomes eligible, 0 when none remain.
    pub fn forget_old_failures(&mut self, revival_delay: i64) -> i64 {
        let mut next_check_delay: i64 = 0;
        for kid in &mut self.storage {
            if !kid.hopeless() {
                continue;
            }
            let death_duration = kid.death_duration();
            if revival_delay <= death_duration {
                kid.forget_failures(); // this kid will be revived now
                continue;
            }
            let remaining = revival_delay - death_duration;
            assert!(remaining > 0);
            if next_check_delay == 0 || remaining < next_check_delay {
                next_check_delay = remaining;
            }
        }
        next_check_delay
    }

    /// Whether all kids called exited happy.
    pub fn all_exited_happy(&self) -> bool {
        self.storage.iter().all(Kid::exited_happy)
    }

    /// Whether some kids died from a given signal.
    pub fn some_signaled(&self, sig: i32) -> bool {
        self.storage.iter().any(|k| k.signaled(sig))
    }

    /// Whether some kids are running.
    pub fn some_running(&self) -> bool {
        self.storage.iter().any(Kid::running)
    }

    /// Whether some kids should be restarted by master.
    pub fn should_restart_some(&self) -> bool {
        self.storage.iter().any(Kid::should_restart)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Kid> {
        self.storage.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn test_roster_composition() {
        let mut kids = Kids::new();
        kids.init(1, 0);
        assert_eq!(kids.count(), 1);
        assert_eq!(kids.get(0).role(), KidRole::Worker);

        kids.init(2, 1);
        // 2 workers + 1 disker + coordinator
        assert_eq!(kids.count(), 4);
        assert_eq!(kids.get(3).role(), KidRole::Coordinator);
    }

    #[test]
    fn test_find_by_pid_and_restart_policy() {
        crate::utils::clock::update_current_time();
        let mut kids = Kids::new();
        kids.init(2, 0);
        kids.get(0).started(pid(100));
        kids.get(1).started(pid(101));
        assert!(kids.some_running());
        assert!(!kids.should_restart_some());

        kids.find(pid(101)).unwrap().stopped(ExitStatus::Signaled(11));
        assert!(kids.some_signaled(11));
        assert!(kids.should_restart_some());
        assert!(!kids.all_exited_happy());
    }

    #[test]
    fn test_fast_crashes_become_hopeless() {
        crate::utils::clock::update_current_time();
        let mut kids = Kids::new();
        kids.init(1, 0);
        let kid = kids.get(0);
        for _ in 0..=BAD_FAILURE_LIMIT {
            kid.started(pid(7));
            kid.stopped(ExitStatus::Exited(1));
        }
        assert!(kid.hopeless());
        assert!(!kid.should_restart());
        assert!(kids.all_hopeless());
    }

    #[test]
    fn test_forget_old_failures_revives_after_delay() {
        crate::utils::clock::update_current_time();
        let mut kids = Kids::new();
        kids.init(1, 0);
        let kid = kids.get(0);
        for _ in 0..=BAD_FAILURE_LIMIT {
            kid.started(pid(8));
            kid.stopped(ExitStatus::Exited(1));
        }
        assert!(kid.hopeless());

        // penalty not served: the remaining delay is reported
        let next = kids.forget_old_failures(3600);
        assert!(next > 0 && next <= 3600);
        assert!(kids.get(0).hopeless());

        // zero delay means immediate revival
        let next = kids.forget_old_failures(0);
        assert_eq!(next, 0);
        assert!(!kids.get(0).hopeless());
        assert!(kids.get(0).should_restart());
    }

    #[test]
    fn test_all_exited_happy() {
        crate::utils::clock::update_current_time();
        let mut kids = Kids::new();
        kids.init(2, 0);
        for i in 0..2 {
            kids.get(i).started(pid(20 + i as i32));
            kids.get(i).stopped(ExitStatus::Exited(0));
        }
        assert!(kids.all_exited_happy());
        assert!(!kids.should_restart_some());
    }
}
