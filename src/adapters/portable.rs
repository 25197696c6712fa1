use super::ProcessAdapter;
use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Cross-platform adapter backed by `sysinfo`.
///
/// Holds one `System` for the whole run and refreshes only memory on each
/// sample. Like the procfs adapter, it measures the child's whole process tree.
pub struct SysinfoAdapter {
    system: System,
}

impl SysinfoAdapter {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessAdapter for SysinfoAdapter {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn sample_memory(&mut self, pid: u32) -> u64 {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );

        let root = Pid::from_u32(pid);
        let processes = self.system.processes();
        if !processes.contains_key(&root) {
            return 0;
        }

        // Threads show up as processes on Linux; they share their owner's memory.
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child_pid, process) in processes {
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*child_pid);
            }
        }

        let mut seen = HashSet::from([root]);
        let mut stack = vec![root];
        let mut total = 0u64;
        while let Some(current) = stack.pop() {
            if let Some(process) = processes.get(&current) {
                total = total.saturating_add(process.memory());
            }
            for kid in children.get(&current).into_iter().flatten() {
                if seen.insert(*kid) {
                    stack.push(*kid);
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_own_process() {
        let mut adapter = SysinfoAdapter::new();
        assert!(adapter.sample_memory(std::process::id()) > 0);
    }

    #[test]
    fn test_unknown_pid_is_zero() {
        let mut adapter = SysinfoAdapter::new();
        // Above the default pid_max on every mainstream kernel
        assert_eq!(adapter.sample_memory(u32::MAX - 1), 0);
    }

    #[test]
    fn test_name() {
        assert_eq!(SysinfoAdapter::new().name(), "sysinfo");
    }
}
