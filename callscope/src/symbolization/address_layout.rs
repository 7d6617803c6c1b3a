//! Process address-space layout: which file is mapped where.
//!
//! Layouts are built from `/proc/<pid>/maps`-format text recorded with the
//! capture. Only file-backed mappings are kept; anonymous regions and
//! pseudo-files such as `[vdso]` cannot be symbolized from disk.

/// One file-backed mapping in a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub begin: u64,
    pub end: u64,
    /// Offset of `begin` within the mapped file
    pub file_offset: u64,
    pub inode: u64,
    pub file: String,
    pub build_id: Option<String>,
}

impl MemoryMap {
    /// Check if an address falls within this mapping
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.begin && addr < self.end
    }

    /// Translate a runtime address into an offset within the mapped file.
    #[must_use]
    pub fn file_relative(&self, addr: u64) -> u64 {
        addr - self.begin + self.file_offset
    }
}

/// All mappings of one process, sorted by begin address.
#[derive(Debug, Clone, Default)]
pub struct AddressLayout {
    maps: Vec<MemoryMap>,
}

impl AddressLayout {
    #[must_use]
    pub fn new(mut maps: Vec<MemoryMap>) -> Self {
        maps.sort_by_key(|m| m.begin);
        Self { maps }
    }

    /// Parse `/proc/<pid>/maps` text.
    ///
    /// Lines look like `start-end perms offset dev inode pathname`. Lines that
    /// fail to parse are skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let maps = text.lines().filter_map(parse_maps_line).collect();
        Self::new(maps)
    }

    /// Find the mapping containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<&MemoryMap> {
        let idx = self.maps.partition_point(|m| m.begin <= addr);
        idx.checked_sub(1).map(|i| &self.maps[i]).filter(|m| m.contains(addr))
    }

    #[must_use]
    pub fn maps(&self) -> &[MemoryMap] {
        &self.maps
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

fn parse_maps_line(line: &str) -> Option<MemoryMap> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 {
        return None;
    }

    // Paths may contain spaces; everything after the inode is the path
    let file = parts[5..].join(" ");
    if !file.starts_with('/') {
        return None;
    }

    let (start, end) = parts[0].split_once('-')?;
    let begin = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let file_offset = u64::from_str_radix(parts[2], 16).ok()?;
    let inode = parts[4].parse().ok()?;

    if begin >= end {
        return None;
    }

    Some(MemoryMap { begin, end, file_offset, inode, file, build_id: None })
}
