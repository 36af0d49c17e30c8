//! PID liveness checks and process-tree enumeration.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Liveness check used by the reconciler. Tests substitute their own.
pub trait ProcessProbe: Send + Sync {
    fn pid_exists(&self, pid: i32) -> bool;
}

/// Probe backed by the real process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn pid_exists(&self, pid: i32) -> bool {
        pid_exists(pid)
    }
}

/// Signal-0 liveness probe.
///
/// Only a definitive ESRCH means "gone"; EPERM and other failures count as
/// alive. Non-positive PIDs are never probed: signal 0 to 0 or -1 addresses a
/// process group or every process, not one app.
pub fn pid_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// An exited-but-unreaped process cannot run any more.
fn is_zombie(pid: i32) -> bool {
    let target = sysinfo::Pid::from_u32(pid as u32);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::new(),
    );
    system
        .process(target)
        .is_some_and(|process| process.status() == ProcessStatus::Zombie)
}

/// One snapshot of `(pid, ppid)` edges from the process table.
fn process_table() -> Vec<(i32, i32)> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
    system
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            let ppid = process.parent()?;
            Some((pid.as_u32() as i32, ppid.as_u32() as i32))
        })
        .collect()
}

/// Collect every descendant of `root` from a list of `(pid, ppid)` edges.
///
/// Walks an explicit queue over a parent→children map; the visited set keeps
/// a malformed table (cycles, PID reuse mid-snapshot) from looping forever.
pub fn descendants(root: i32, table: &[(i32, i32)]) -> BTreeSet<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for &(pid, ppid) in table {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = BTreeSet::new();
    let mut visited = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        let Some(direct) = children.get(&pid) else {
            continue;
        };
        for &child in direct {
            if visited.insert(child) {
                found.insert(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// All live descendants of `pid`. Empty when it has none or already exited.
pub fn children_of(pid: i32) -> BTreeSet<i32> {
    if pid <= 0 {
        return BTreeSet::new();
    }
    descendants(pid, &process_table())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_exists_for_self() {
        assert!(pid_exists(std::process::id() as i32));
    }

    #[test]
    fn test_pid_exists_nonexistent() {
        assert!(!pid_exists(999_999_999));
    }

    #[test]
    fn test_pid_exists_rejects_non_positive() {
        assert!(!pid_exists(0));
        assert!(!pid_exists(-1));
    }

    #[test]
    fn test_pid_exists_running_child() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id() as i32;
        assert!(pid_exists(pid));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!pid_exists(pid));
    }

    #[test]
    fn test_zombie_counts_as_gone() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        // Never waited on, so it lingers as a zombie once it exits.
        let mut gone = false;
        for _ in 0..100 {
            if !pid_exists(pid) {
                gone = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(gone, "{pid} still reported alive");
        assert!(kill(Pid::from_raw(pid), None).is_ok());
        drop(child);
    }

    #[test]
    fn test_process_table_sees_self_and_parent() {
        let me = std::process::id() as i32;
        let table = process_table();
        assert!(table.iter().any(|&(pid, ppid)| pid == me && ppid > 0));
    }

    #[test]
    fn test_descendants_walks_full_tree() {
        let table = vec![
            (1, 0),
            (10, 1),
            (11, 10),
            (12, 10),
            (13, 12),
            (20, 1),
            (21, 20),
        ];
        let found = descendants(10, &table);
        assert_eq!(found, BTreeSet::from([11, 12, 13]));
    }

    #[test]
    fn test_descendants_leaf_and_unknown() {
        let table = vec![(1, 0), (10, 1)];
        assert!(descendants(10, &table).is_empty());
        assert!(descendants(555, &table).is_empty());
    }

    #[test]
    fn test_descendants_survives_cycle() {
        let table = vec![(10, 11), (11, 10), (12, 11)];
        let found = descendants(10, &table);
        assert_eq!(found, BTreeSet::from([11, 12]));
    }

    #[test]
    fn test_children_of_real_tree() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 5 & sleep 5 & wait"])
            .spawn()
            .unwrap();
        let pid = child.id() as i32;

        // Give the shell a moment to fork its children.
        let mut found = BTreeSet::new();
        for _ in 0..50 {
            found = children_of(pid);
            if found.len() >= 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(found.len() >= 2, "expected two sleep children, got {found:?}");

        for pid in &found {
            let _ = kill(Pid::from_raw(*pid), nix::sys::signal::Signal::SIGKILL);
        }
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_children_of_gone_process() {
        assert!(children_of(999_999_999).is_empty());
        assert!(children_of(-1).is_empty());
    }
}
