use std::fmt;

use crate::balance::Replica;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Lost,
    Underreplicated,
    JustRight,
    Overreplicated,
    Unreferenced,
    Garbage,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Category::Lost => "lost (0=have<want)",
            Category::Underreplicated => "underreplicated (0<have<want)",
            Category::JustRight => "just right (have=want)",
            Category::Overreplicated => "overreplicated (have>want>0)",
            Category::Unreferenced => "unreferenced (have>want=0, new)",
            Category::Garbage => "garbage (have>want=0, old)",
        }
    }
}

pub fn categorize(desired: i64, replicas: &[Replica], min_mtime: i64) -> Option<Category> {
    let have = replicas.len() as i64;
    let category = match (have, desired) {
        (0, 0) => return None,
        (0, _) => Category::Lost,
        (h, d) if h < d => Category::Underreplicated,
        (h, d) if h == d => Category::JustRight,
        (_, d) if d > 0 => Category::Overreplicated,
        _ if replicas.iter().any(|r| r.mtime >= min_mtime) => Category::Unreferenced,
        _ => Category::Garbage,
    };
    Some(category)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub replicas: u64,
    pub blocks: u64,
    pub bytes: u64,
}

impl Tally {
    fn add(&mut self, replicas: u64, block_size: u64) {
        self.replicas += replicas;
        self.blocks += 1;
        self.bytes += replicas * block_size;
    }

    fn merge(&mut self, other: &Tally) {
        self.replicas += other.replicas;
        self.blocks += other.blocks;
        self.bytes += other.bytes;
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} replicas ({} blocks, {} bytes)",
            self.replicas, self.blocks, self.bytes
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceStats {
    pub lost: Tally,
    pub underreplicated: Tally,
    pub just_right: Tally,
    pub overreplicated: Tally,
    pub unreferenced: Tally,
    pub garbage: Tally,
    pub desired: Tally,
    pub current: Tally,
    pub pulls: u64,
    pub trashes: u64,
    pub replication_histogram: Vec<u64>,
}

impl BalanceStats {
    pub fn record(&mut self, block_size: u64, desired: i64, replicas: &[Replica], min_mtime: i64) {
        let have = replicas.len() as u64;
        let want = desired.max(0) as u64;
        if let Some(category) = categorize(desired, replicas, min_mtime) {
            match category {
                Category::Lost => self.lost.add(want, block_size),
                Category::Underreplicated => self.underreplicated.add(want - have, block_size),
                Category::JustRight => self.just_right.add(have, block_size),
                Category::Overreplicated => self.overreplicated.add(have - want, block_size),
                Category::Unreferenced => self.unreferenced.add(have, block_size),
                Category::Garbage => self.garbage.add(have, block_size),
            }
        }
        if want > 0 {
            self.desired.add(want, block_size);
        }
        if have > 0 {
            self.current.add(have, block_size);
        }

        let idx = replicas.len();
        if self.replication_histogram.len() <= idx {
            self.replication_histogram.resize(idx + 1, 0);
        }
        self.replication_histogram[idx] += 1;
    }

    pub fn merge(&mut self, other: &BalanceStats) {
        for (mine, theirs) in [
            (&mut self.lost, &other.lost),
            (&mut self.underreplicated, &other.underreplicated),
            (&mut self.just_right, &other.just_right),
            (&mut self.overreplicated, &other.overreplicated),
            (&mut self.unreferenced, &other.unreferenced),
            (&mut self.garbage, &other.garbage),
            (&mut self.desired, &other.desired),
            (&mut self.current, &other.current),
        ] {
            mine.merge(theirs);
        }
        self.pulls += other.pulls;
        self.trashes += other.trashes;
        if self.replication_histogram.len() < other.replication_histogram.len() {
            self.replication_histogram
                .resize(other.replication_histogram.len(), 0);
        }
        for (idx, count) in other.replication_histogram.iter().enumerate() {
            self.replication_histogram[idx] += count;
        }
    }

    /// Report lines in log order. `service_lines` go between the totals
    /// and the histogram.
    pub fn report_lines(&self, service_lines: &[String]) -> Vec<String> {
        let sep = "===".to_string();
        let mut lines = vec![sep.clone()];
        for (tally, category) in [
            (&self.lost, Category::Lost),
            (&self.underreplicated, Category::Underreplicated),
            (&self.just_right, Category::JustRight),
            (&self.overreplicated, Category::Overreplicated),
            (&self.unreferenced, Category::Unreferenced),
            (&self.garbage, Category::Garbage),
        ] {
            lines.push(format!("{tally} {}", category.label()));
        }
        lines.push(sep.clone());
        lines.push(format!(
            "{} total commitment (excluding unreferenced)",
            self.desired
        ));
        lines.push(format!("{} total usage", self.current));
        lines.push(sep.clone());
        lines.extend(service_lines.iter().cloned());
        lines.push(sep.clone());
        lines.extend(self.histogram_lines(60));
        lines.push(sep);
        lines
    }

    pub fn histogram_lines(&self, hash_columns: usize) -> Vec<String> {
        let mut lines = vec!["Replication level distribution:".to_string()];
        let max_count = self.replication_histogram.iter().copied().max().unwrap_or(0);
        let log_max = ((max_count + 1) as f64).log10();
        let count_width = 1 + log_max as usize;
        let scale = 10.0 * hash_columns as f64 / (1.0 + 10.0 * log_max).floor();
        for (repl, &count) in self.replication_histogram.iter().enumerate() {
            let n_hashes = ((scale * ((count + 1) as f64).log10()) as usize).min(hash_columns);
            lines.push(format!(
                "{repl:2}: {count:>count_width$} {}",
                "#".repeat(n_hashes)
            ));
        }
        lines
    }
}
