//! Parsing of rsync output: `--list-only` listings and `--stats` summaries.

use once_cell::sync::Lazy;
use regex::Regex;

// drwxr-xr-x          4,096 2024/03/01 10:12:55 name
static LIST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([dlcbps-])[rwxsStT-]{9}[.+@]?\s+([\d,.]+)\s+\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2}\s+(.+)$",
    )
    .expect("listing regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

impl ListEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

pub fn parse_list_line(line: &str) -> Option<ListEntry> {
    let caps = LIST_LINE.captures(line.trim_end())?;
    let kind = match &caps[1] {
        "d" => EntryKind::Dir,
        "-" => EntryKind::File,
        "l" => EntryKind::Symlink,
        _ => EntryKind::Other,
    };
    let size = caps[2].replace([',', '.'], "").parse::<u64>().ok()?;
    let mut name = caps[3].to_string();
    if kind == EntryKind::Symlink {
        if let Some(pos) = name.find(" -> ") {
            name.truncate(pos);
        }
    }
    Some(ListEntry { name, kind, size })
}

/// Parses a listing, dropping the `.` entry rsync prints for the folder itself.
pub fn parse_listing(output: &str) -> Vec<ListEntry> {
    output
        .lines()
        .filter_map(parse_list_line)
        .filter(|e| e.name != ".")
        .collect()
}

/// Sum of regular file sizes in a recursive listing.
pub fn sum_file_sizes(output: &str) -> u64 {
    output
        .lines()
        .filter_map(parse_list_line)
        .filter(|e| e.kind == EntryKind::File)
        .map(|e| e.size)
        .sum()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub file_count: Option<u64>,
    pub files_transferred: Option<u64>,
    pub total_file_size: Option<u64>,
    pub transferred_size: Option<u64>,
}

impl TransferStats {
    pub fn feed_line(&mut self, line: &str) {
        if line.contains("Number of files:") {
            self.file_count = parse_number_from_line(line);
        } else if line.contains("Number of regular files transferred:") {
            self.files_transferred = parse_number_from_line(line);
        } else if line.contains("Total file size:") {
            self.total_file_size = parse_number_from_line(line);
        } else if line.contains("Total transferred file size:") {
            self.transferred_size = parse_number_from_line(line);
        }
    }

    pub fn from_output(output: &str) -> Self {
        let mut stats = Self::default();
        for line in output.lines() {
            stats.feed_line(line);
        }
        stats
    }
}

fn parse_number_from_line(line: &str) -> Option<u64> {
    // "Number of files: 1,234 (reg: 1,000, dir: 234)" / "Total file size: 1,234,567 bytes"
    let colon_pos = line.find(':')?;
    let after_colon = line[colon_pos + 1..].trim();
    let num_str = after_colon.split_whitespace().next()?.replace(',', "");
    num_str.parse::<u64>().ok()
}
