use super::ProcessAdapter;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

pub const PROC_ROOT: &str = "/proc";

/// Linux adapter reading resident memory straight from `/proc`.
///
/// Sums `VmRSS` over the child and every process whose parent chain leads back
/// to it, so a shell wrapper and the job it launches are measured together.
pub struct ProcfsAdapter {
    root: PathBuf,
}

impl ProcfsAdapter {
    pub fn new() -> Self {
        Self::with_root(PROC_ROOT)
    }

    /// Use an alternate proc root (tests point this at a fixture tree).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn rss_bytes(&self, pid: u32) -> Option<u64> {
        let status = std::fs::read_to_string(self.root.join(pid.to_string()).join("status")).ok()?;
        parse_vm_rss_kb(&status).map(|kb| kb * 1024)
    }

    /// Map every live pid to its parent pid.
    fn parent_map(&self) -> HashMap<u32, u32> {
        let mut parents = HashMap::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, root = %self.root.display(), "cannot list proc root");
                return parents;
            }
        };
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(ppid) = parse_stat_ppid(&stat) {
                parents.insert(pid, ppid);
            }
        }
        parents
    }

    fn process_tree(&self, pid: u32) -> Vec<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (child, parent) in self.parent_map() {
            children.entry(parent).or_default().push(child);
        }

        let mut tree = vec![pid];
        let mut queue = VecDeque::from([pid]);
        while let Some(current) = queue.pop_front() {
            if let Some(kids) = children.get(&current) {
                for &kid in kids {
                    if !tree.contains(&kid) {
                        tree.push(kid);
                        queue.push_back(kid);
                    }
                }
            }
        }
        tree
    }
}

impl Default for ProcfsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessAdapter for ProcfsAdapter {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn sample_memory(&mut self, pid: u32) -> u64 {
        self.process_tree(pid)
            .into_iter()
            .filter_map(|p| self.rss_bytes(p))
            .sum()
    }
}

/// True when `root` looks like a readable procfs mount.
pub fn available(root: &Path) -> bool {
    cfg!(target_os = "linux") && root.join("self").join("status").is_file()
}

/// `VmRSS:   12345 kB` → 12345. Zombies and kernel threads have no VmRSS line.
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

/// The parent pid is the second field after the parenthesised command name.
/// The name itself may contain spaces and parentheses, so split on the last `)`.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_proc(root: &Path, pid: u32, ppid: u32, rss_kb: Option<u64>) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("stat"),
            format!("{pid} (worker (py)) S {ppid} {pid} {pid} 0 -1 4194560"),
        )
        .unwrap();
        let rss = rss_kb
            .map(|kb| format!("VmRSS:\t{kb:>8} kB\n"))
            .unwrap_or_default();
        std::fs::write(
            dir.join("status"),
            format!("Name:\tworker\nState:\tS (sleeping)\n{rss}Threads:\t1\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tpython3\nVmPeak:\t  20000 kB\nVmRSS:\t   10240 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_kb(status), Some(10240));
        assert_eq!(parse_vm_rss_kb("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn test_parse_stat_ppid_with_tricky_name() {
        assert_eq!(parse_stat_ppid("42 (a) b) c) R 7 42 42 0"), Some(7));
        assert_eq!(parse_stat_ppid("1 (init) S 0 1 1"), Some(0));
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn test_sums_process_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_proc(root, 100, 1, Some(1024)); // the child
        write_proc(root, 101, 100, Some(2048)); // its worker
        write_proc(root, 102, 101, Some(512)); // grandchild
        write_proc(root, 200, 1, Some(999_999)); // unrelated
        std::fs::create_dir_all(root.join("self")).unwrap();

        let mut adapter = ProcfsAdapter::with_root(root);
        assert_eq!(adapter.sample_memory(100), (1024 + 2048 + 512) * 1024);
        assert_eq!(adapter.sample_memory(101), (2048 + 512) * 1024);
    }

    #[test]
    fn test_missing_process_is_zero() {
        let dir = tempdir().unwrap();
        let mut adapter = ProcfsAdapter::with_root(dir.path());
        assert_eq!(adapter.sample_memory(4242), 0);
    }

    #[test]
    fn test_zombie_parent_still_counts_children() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_proc(root, 100, 1, None);
        write_proc(root, 101, 100, Some(300));

        let mut adapter = ProcfsAdapter::with_root(root);
        assert_eq!(adapter.sample_memory(100), 300 * 1024);
    }

    #[test]
    fn test_available_requires_self_status() {
        let dir = tempdir().unwrap();
        assert!(!available(dir.path()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_samples_own_process() {
        let mut adapter = ProcfsAdapter::new();
        assert!(adapter.sample_memory(std::process::id()) > 0);
    }
}
