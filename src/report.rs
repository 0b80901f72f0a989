//! Memory usage reports.
//!
//! Three formats are produced:
//! - [`Report`]: totals, plus (for the guarded allocator) a table of live
//!   memory aggregated by block name, largest first.
//! - [`StructuredReport`]: one record per live block in Python syntax,
//!   followed by a short script that aggregates the records by size, number
//!   of users and name. Meant to be saved and post-processed offline.
//! - [`BlockList`]: one plain line per live block.

use core::fmt::{self, Display};

use rustc_hash::FxHashMap;

const MIB: f64 = 1024.0 * 1024.0;

/// A live block, as seen by a report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    /// The block name.
    pub name: String,
    /// The payload length.
    pub len: usize,
    /// The payload address.
    pub addr: usize,
}

/// Live memory of all blocks sharing one name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportEntry {
    /// The shared block name.
    pub name: String,
    /// How many live blocks have this name.
    pub items: usize,
    /// Their total payload length.
    pub len: usize,
}

/// Usage totals and, if available, usage per block name.
#[derive(Clone, Debug)]
pub struct Report {
    total: usize,
    peak: usize,
    entries: Option<Vec<ReportEntry>>,
}
impl Report {
    /// A report with totals only.
    pub(crate) fn summary(total: usize, peak: usize) -> Self {
        Self {
            total,
            peak,
            entries: None,
        }
    }

    /// Aggregates blocks by name. Entries are ordered by total length,
    /// largest first, then by name.
    pub(crate) fn aggregate(total: usize, peak: usize, blocks: &[BlockRecord]) -> Self {
        let mut by_name: FxHashMap<&str, (usize, usize)> = FxHashMap::default();
        for block in blocks {
            let entry = by_name.entry(block.name.as_str()).or_default();
            entry.0 += 1;
            entry.1 += block.len;
        }
        let mut entries: Vec<_> = by_name
            .into_iter()
            .map(|(name, (items, len))| ReportEntry {
                name: name.to_owned(),
                items,
                len,
            })
            .collect();
        entries.sort_by(|a, b| b.len.cmp(&a.len).then_with(|| a.name.cmp(&b.name)));
        Self {
            total,
            peak,
            entries: Some(entries),
        }
    }

    /// Bytes in use when the report was taken.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Peak bytes when the report was taken.
    pub fn peak_bytes(&self) -> usize {
        self.peak
    }

    /// Usage per name, or an empty slice if the allocator does not track
    /// names.
    pub fn entries(&self) -> &[ReportEntry] {
        self.entries.as_deref().unwrap_or_default()
    }
}
impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "total memory len: {:.3} MB", self.total as f64 / MIB)?;
        writeln!(f, "peak memory len: {:.3} MB", self.peak as f64 / MIB)?;
        if let Some(entries) = &self.entries {
            writeln!(f, " ITEMS TOTAL-MiB AVERAGE-KiB TYPE")?;
            for entry in entries {
                writeln!(
                    f,
                    "{:6} ({:8.3}  {:8.3}) {}",
                    entry.items,
                    entry.len as f64 / MIB,
                    entry.len as f64 / 1024.0 / entry.items as f64,
                    entry.name
                )?;
            }
        }
        Ok(())
    }
}

/// A script-parseable dump of every live block.
#[derive(Clone, Debug, Default)]
pub struct StructuredReport {
    records: Vec<BlockRecord>,
}
impl StructuredReport {
    pub(crate) fn new(records: Vec<BlockRecord>) -> Self {
        Self { records }
    }

    /// The dumped blocks, in registry order.
    pub fn records(&self) -> &[BlockRecord] {
        &self.records
    }
}

/// Escapes a name for a Python triple-quoted string.
struct Quoted<'a>(&'a str);
impl Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '\\' => f.write_str("\\\\")?,
                '\'' => f.write_str("\\'")?,
                '\n' => f.write_str("\\n")?,
                c => write!(f, "{c}")?,
            }
        }
        Ok(())
    }
}

const AGGREGATE_SCRIPT: &str = "\
mb_userinfo = {}
totmem = 0
for mb_item in mem_in_use_script:
    mb_item_user_size = mb_userinfo.setdefault(mb_item['name'], [0, 0])
    mb_item_user_size[0] += 1
    mb_item_user_size[1] += mb_item['len']
    totmem += mb_item['len']
print('(membase) items:', len(mem_in_use_script), '| unique-names:', len(mb_userinfo), '| total-mem:', totmem)
mb_userinfo_sort = list(mb_userinfo.items())
for sort_name, sort_func in (('size', lambda a: -a[1][1]), ('users', lambda a: -a[1][0]), ('name', lambda a: a[0])):
    print('\\n%s:' % sort_name)
    mb_userinfo_sort.sort(key=sort_func)
    for item in mb_userinfo_sort:
        print('name:%s, users:%i, len:%i' % (item[0], item[1][0], item[1][1]))
";

impl Display for StructuredReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mem_in_use_script = [")?;
        for record in &self.records {
            writeln!(
                f,
                "{{'len':{}, 'name':'''{}''', 'pointer':'{:#x}'}},",
                record.len,
                Quoted(&record.name),
                record.addr
            )?;
        }
        writeln!(f, "]")?;
        f.write_str(AGGREGATE_SCRIPT)
    }
}

/// One line per live block: name, length and address.
#[derive(Clone, Debug, Default)]
pub struct BlockList {
    records: Vec<BlockRecord>,
}
impl BlockList {
    pub(crate) fn new(records: Vec<BlockRecord>) -> Self {
        Self { records }
    }

    /// The listed blocks, in registry order.
    pub fn records(&self) -> &[BlockRecord] {
        &self.records
    }
}
impl Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{} len: {} {:#x}", record.name, record.len, record.addr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, len: usize, addr: usize) -> BlockRecord {
        BlockRecord {
            name: name.to_owned(),
            len,
            addr,
        }
    }

    #[test]
    fn aggregates_by_name_largest_first() {
        let blocks = [
            record("mesh", 100, 0x10),
            record("verts", 1000, 0x20),
            record("mesh", 300, 0x30),
            record("edges", 400, 0x40),
        ];
        let report = Report::aggregate(1800, 2048, &blocks);
        let entries = report.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!((entries[0].name.as_str(), entries[0].items), ("verts", 1));
        assert_eq!(
            (entries[1].name.as_str(), entries[1].items, entries[1].len),
            ("edges", 1, 400)
        );
        assert_eq!(
            (entries[2].name.as_str(), entries[2].items, entries[2].len),
            ("mesh", 2, 400)
        );

        let text = report.to_string();
        assert!(text.contains("total memory len: 0.002 MB"));
        assert!(text.contains(" ITEMS TOTAL-MiB AVERAGE-KiB TYPE"));
        assert!(text.contains("     2 (   0.000     0.195) mesh"));
    }

    #[test]
    fn summary_has_no_table() {
        let report = Report::summary(3 * 1024 * 1024, 4 * 1024 * 1024);
        let text = report.to_string();
        assert!(text.contains("total memory len: 3.000 MB"));
        assert!(text.contains("peak memory len: 4.000 MB"));
        assert!(!text.contains("ITEMS"));
        assert!(report.entries().is_empty());
    }

    #[test]
    fn structured_records_are_parseable_lines() {
        let report = StructuredReport::new(vec![record("it's", 8, 0xbeef)]);
        let text = report.to_string();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("mem_in_use_script = ["));
        assert_eq!(
            lines.next(),
            Some("{'len':8, 'name':'''it\\'s''', 'pointer':'0xbeef'},")
        );
        assert_eq!(lines.next(), Some("]"));
        assert!(text.contains("for mb_item in mem_in_use_script:"));
    }

    #[test]
    fn block_list_lines() {
        let list = BlockList::new(vec![record("a", 4, 0x10), record("b", 8, 0x20)]);
        assert_eq!(list.to_string(), "a len: 4 0x10\nb len: 8 0x20\n");
    }
}
