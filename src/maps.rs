//! `/proc/<pid>/maps` lines.
//!
//! ```text
//! 7f2c1a400000-7f2c1a428000 r-xp 00028000 08:01 1054 /usr/lib/libc.so.6
//! ```


use arrayvec::ArrayString;

use crate::PATH_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    /// File offset the mapping starts at.
    pub offset: usize,
    pub perms: Permissions,
    /// Backing file, or a pseudo-path like `[stack]`, or empty for anonymous
    /// memory. Truncated if it does not fit.
    pub path: ArrayString<PATH_CAPACITY>,
}

impl MapEntry {
    pub fn parse(line: &str) -> Option<MapEntry> {
        let mut rest = line;
        let mut field = || {
            let trimmed = rest.trim_start_matches(' ');
            let end = trimmed.find(' ').unwrap_or(trimmed.len());
            let (field, tail) = trimmed.split_at(end);
            rest = tail;
            Some(field).filter(|f| !f.is_empty())
        };

        let range = field()?;
        let perms = field()?.as_bytes();
        let offset = field()?;
        let _dev = field()?;
        let _inode = field()?;

        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if end < start {
            return None;
        }

        let [r, w, x, p] = perms else {
            return None;
        };
        let perms = Permissions {
            read: *r == b'r',
            write: *w == b'w',
            execute: *x == b'x',
            private: *p == b'p',
        };

        let mut path = ArrayString::new();
        let mut remaining = rest.trim();
        while let Some(c) = remaining.chars().next() {
            if path.try_push(c).is_err() {
                break;
            }
            remaining = &remaining[c.len_utf8()..];
        }

        Some(MapEntry {
            start,
            end,
            offset: usize::from_str_radix(offset, 16).ok()?,
            perms,
            path,
        })
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Whether this maps part of a file, as opposed to anonymous memory or
    /// something like `[vdso]`.
    pub fn is_file(&self) -> bool {
        self.path.starts_with('/')
    }

    /// What has to be subtracted from a pc in this mapping to get its offset
    /// in the file.
    pub fn load_bias(&self) -> usize {
        self.start.wrapping_sub(self.offset)
    }
}
