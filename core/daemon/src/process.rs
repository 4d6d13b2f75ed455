//! Process inspection helpers for the scanner.

use std::collections::{HashMap, VecDeque};

use sysinfo::System;

const MAX_DESCENDANT_DEPTH: usize = 4;

/// Parent/child view of the process table, captured once per scan tick.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    children: HashMap<u32, Vec<u32>>,
    labels: HashMap<u32, String>,
}

impl ProcessTable {
    /// `entries` are `(pid, parent pid, label)`; the label is the process
    /// name followed by its command line.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, Option<u32>, String)>,
    {
        let mut table = Self::default();
        for (pid, parent, label) in entries {
            if let Some(parent) = parent {
                table.children.entry(parent).or_default().push(pid);
            }
            table.labels.insert(pid, label);
        }
        table
    }

    /// True when a process below `root` (within a few levels) mentions `needle`.
    pub fn has_descendant_matching(&self, root: u32, needle: &str) -> bool {
        let mut queue = VecDeque::from([(root, 0usize)]);
        while let Some((pid, depth)) = queue.pop_front() {
            if depth >= MAX_DESCENDANT_DEPTH {
                continue;
            }
            for child in self.children.get(&pid).into_iter().flatten() {
                let matches = self
                    .labels
                    .get(child)
                    .map(|label| label.contains(needle))
                    .unwrap_or(false);
                if matches {
                    return true;
                }
                queue.push_back((*child, depth + 1));
            }
        }
        false
    }
}

pub trait ProcessSource: Send + Sync {
    fn snapshot(&self) -> ProcessTable;
}

#[derive(Debug, Clone, Default)]
pub struct SysinfoProcessSource;

impl ProcessSource for SysinfoProcessSource {
    fn snapshot(&self) -> ProcessTable {
        let mut sys = System::new();
        sys.refresh_processes();
        ProcessTable::from_entries(sys.processes().iter().map(|(pid, process)| {
            let label = format!("{} {}", process.name(), process.cmd().join(" "));
            (
                pid.as_u32(),
                process.parent().map(|parent| parent.as_u32()),
                label,
            )
        }))
    }
}
