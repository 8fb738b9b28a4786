use std::cmp::Ordering;
use std::rc::Rc;

use super::callchain::CallChainRoot;
use super::dso::{Dso, SymbolEntry};

/// One aggregated report row: samples that compared equal under the tree's
/// comparator, with their accumulated period and call-chain tree.
pub struct SampleEntry {
    pub pid: i32,
    pub tid: i32,
    pub thread_comm: String,
    pub dso: Rc<Dso>,
    pub symbol: Rc<SymbolEntry>,
    pub period: u64,
    pub sample_count: u64,
    pub callchain: CallChainRoot<Rc<SymbolEntry>>,
}

pub type SampleComparator = Box<dyn Fn(&SampleEntry, &SampleEntry) -> Ordering>;

/// Aggregates samples in two stages: insertion groups equal keys under a
/// user-supplied comparator; the finished tree is then visited in period
/// order with the insertion comparator as tiebreaker.
pub struct SampleTree {
    comparator: SampleComparator,
    /// Kept sorted by `comparator`.
    entries: Vec<SampleEntry>,
    total_samples: u64,
    total_period: u64,
}

impl SampleTree {
    pub fn new(comparator: SampleComparator) -> SampleTree {
        SampleTree {
            comparator,
            entries: Vec::new(),
            total_samples: 0,
            total_period: 0,
        }
    }

    /// Insert one sample; equal keys accumulate counts, period, and the
    /// call chain.
    pub fn add_sample(&mut self, sample: SampleEntry, callchain: &[Rc<SymbolEntry>]) {
        self.total_samples += 1;
        self.total_period += sample.period;
        match self
            .entries
            .binary_search_by(|existing| (self.comparator)(existing, &sample))
        {
            Ok(index) => {
                let entry = &mut self.entries[index];
                entry.sample_count += sample.sample_count;
                entry.period += sample.period;
                if !callchain.is_empty() {
                    entry.callchain.add_callchain(callchain, sample.period);
                }
            }
            Err(index) => {
                let mut entry = sample;
                if !callchain.is_empty() {
                    let period = entry.period;
                    entry.callchain.add_callchain(callchain, period);
                }
                self.entries.insert(index, entry);
            }
        }
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn total_period(&self) -> u64 {
        self.total_period
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Visit entries ordered by period descending, then by the insertion
    /// comparator. Call chains are period-sorted on the way out.
    pub fn visit_all(&mut self, mut callback: impl FnMut(&SampleEntry)) {
        let comparator = &self.comparator;
        self.entries.sort_by(|a, b| {
            b.period
                .cmp(&a.period)
                .then_with(|| comparator(a, b))
        });
        for entry in &mut self.entries {
            entry.callchain.sort_by_period();
        }
        for entry in &self.entries {
            callback(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::dso::{DsoType, SymbolConfig};

    fn entry(tid: i32, comm: &str, symbol_name: &str, period: u64) -> SampleEntry {
        let config = Rc::new(SymbolConfig::default());
        SampleEntry {
            pid: tid,
            tid,
            thread_comm: comm.to_string(),
            dso: Rc::new(Dso::new(DsoType::ElfFile, 1, "/lib/x.so", config)),
            symbol: Rc::new(SymbolEntry {
                addr: 0,
                len: 0,
                name: symbol_name.to_string(),
                demangled_name: String::new(),
            }),
            period,
            sample_count: 1,
            callchain: CallChainRoot::new(),
        }
    }

    fn by_tid_and_symbol() -> SampleComparator {
        Box::new(|a, b| {
            a.tid
                .cmp(&b.tid)
                .then_with(|| a.symbol.name.cmp(&b.symbol.name))
        })
    }

    #[test]
    fn equal_keys_accumulate() {
        let mut tree = SampleTree::new(by_tid_and_symbol());
        tree.add_sample(entry(1, "app", "work", 10), &[]);
        tree.add_sample(entry(1, "app", "work", 5), &[]);
        tree.add_sample(entry(2, "app", "work", 3), &[]);

        assert_eq!(tree.entry_count(), 2);
        assert_eq!(tree.total_samples(), 3);
        assert_eq!(tree.total_period(), 18);

        let mut rows = Vec::new();
        tree.visit_all(|e| rows.push((e.tid, e.period, e.sample_count)));
        assert_eq!(rows, vec![(1, 15, 2), (2, 3, 1)]);
    }

    #[test]
    fn visit_orders_by_period_then_comparator() {
        let mut tree = SampleTree::new(by_tid_and_symbol());
        tree.add_sample(entry(3, "c", "s3", 5), &[]);
        tree.add_sample(entry(1, "a", "s1", 5), &[]);
        tree.add_sample(entry(2, "b", "s2", 9), &[]);

        let mut order = Vec::new();
        tree.visit_all(|e| order.push(e.tid));
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn callchains_merge_per_entry() {
        let symbol = |name: &str| {
            Rc::new(SymbolEntry {
                addr: 0,
                len: 0,
                name: name.to_string(),
                demangled_name: String::new(),
            })
        };
        let mut tree = SampleTree::new(by_tid_and_symbol());
        let chain1 = vec![symbol("f"), symbol("g"), symbol("h")];
        let chain2 = vec![symbol("f"), symbol("g"), symbol("k")];
        tree.add_sample(entry(1, "app", "work", 10), &chain1);
        tree.add_sample(entry(1, "app", "work", 5), &chain2);

        let mut seen = 0;
        tree.visit_all(|e| {
            seen += 1;
            assert_eq!(e.callchain.children_period, 15);
            assert_eq!(e.callchain.children.len(), 1);
            assert_eq!(e.callchain.children[0].chain.len(), 2);
        });
        assert_eq!(seen, 1);
    }
}
