// MIT License - Copyright (c) 2021 TJForc

use std::collections::BTreeMap;

use crate::constants::EPROM_PAGE_SIZE;

/// Filler for bytes the panel has not sent yet.
pub const SENTINEL: u8 = 0xFF;

/// Sparse page-indexed copy of the panel EPROM.
///
/// Every allocated page is exactly [`EPROM_PAGE_SIZE`] bytes, pre-filled
/// with [`SENTINEL`].
#[derive(Debug, Clone, Default)]
pub struct EpromStore {
    pages: BTreeMap<u8, Box<[u8; EPROM_PAGE_SIZE]>>,
}

/// Result of a store read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpromRead {
    pub data: Vec<u8>,
    /// Pages touched by the read that were never written
    pub missing: Vec<u8>,
}

impl EpromRead {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

impl EpromStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `data` at (page, index), continuing onto following pages as needed.
    pub fn write(&mut self, page: u8, index: u8, data: &[u8]) {
        let mut page = page;
        let mut index = index as usize;
        let mut rest = data;
        while !rest.is_empty() {
            let n = rest.len().min(EPROM_PAGE_SIZE - index);
            let buf = self
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([SENTINEL; EPROM_PAGE_SIZE]));
            buf[index..index + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            index = 0;
            match page.checked_add(1) {
                Some(next) => page = next,
                None => break,
            }
        }
    }

    pub fn write_addr(&mut self, addr: u16, data: &[u8]) {
        let [page, index] = addr.to_be_bytes();
        self.write(page, index, data);
    }

    /// Read `len` bytes at (page, index). Unavailable pages read as sentinel bytes.
    pub fn read(&self, page: u8, index: u8, len: usize) -> EpromRead {
        let mut data = Vec::with_capacity(len);
        let mut missing = Vec::new();
        let mut page = Some(page);
        let mut index = index as usize;
        while data.len() < len {
            let Some(p) = page else {
                data.resize(len, SENTINEL);
                break;
            };
            let n = (len - data.len()).min(EPROM_PAGE_SIZE - index);
            match self.pages.get(&p) {
                Some(buf) => data.extend_from_slice(&buf[index..index + n]),
                None => {
                    missing.push(p);
                    data.extend(std::iter::repeat_n(SENTINEL, n));
                }
            }
            index = 0;
            page = p.checked_add(1);
        }
        EpromRead { data, missing }
    }

    pub fn read_addr(&self, addr: u16, len: usize) -> EpromRead {
        let [page, index] = addr.to_be_bytes();
        self.read(page, index, len)
    }

    pub fn page(&self, page: u8) -> Option<&[u8]> {
        self.pages.get(&page).map(|b| &b[..])
    }

    pub fn has_page(&self, page: u8) -> bool {
        self.pages.contains_key(&page)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}
