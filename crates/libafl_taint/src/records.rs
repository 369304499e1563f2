//! # records
//! Structured records of guest queries and attack points, and where they go.
use alloc::rc::Rc;
use core::cell::RefCell;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::{labels::Label, Error, GuestAddr, GuestVirtAddr};

/// Source provenance the guest attaches to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcInfo {
    pub filename: u32,
    pub ast_node_name: u32,
    pub linenum: u32,
    /// Only set when the guest gave one
    pub insertion_point: Option<u32>,
    pub ast_loc_id: u32,
}

/// Labels of one tainted byte of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintQueryEntry {
    /// Position of the byte inside the queried buffer
    pub offset: u32,
    pub labels: Vec<Label>,
}

/// Result of a guest taint query with at least one tainted byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintQueryRecord {
    pub buf: GuestVirtAddr,
    pub len: u32,
    pub num_tainted: u32,
    /// The first bytes of the buffer, as the guest sees them
    pub data: Vec<u8>,
    pub src_info: SrcInfo,
    pub call_stack: Vec<GuestAddr>,
    pub taint_query: Vec<TaintQueryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackPointRecord {
    pub info: String,
    pub src_info: SrcInfo,
    pub call_stack: Vec<GuestAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    TaintQuery(TaintQueryRecord),
    AttackPoint(AttackPointRecord),
}

/// Consumer of [`LogEntry`]s.
pub trait EventSink {
    fn write_entry(&mut self, entry: LogEntry) -> Result<(), Error>;
}

impl<S> EventSink for Rc<RefCell<S>>
where
    S: EventSink,
{
    fn write_entry(&mut self, entry: LogEntry) -> Result<(), Error> {
        self.borrow_mut().write_entry(entry)
    }
}

/// Keeps every entry in memory.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    entries: Vec<LogEntry>,
}

impl VecEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn take(&mut self) -> Vec<LogEntry> {
        core::mem::take(&mut self.entries)
    }
}

impl EventSink for VecEventSink {
    fn write_entry(&mut self, entry: LogEntry) -> Result<(), Error> {
        self.entries.push(entry);
        Ok(())
    }
}

/// Writes one JSON document per entry and line.
#[derive(Debug)]
pub struct JsonLinesEventSink<W> {
    writer: W,
}

impl<W> JsonLinesEventSink<W>
where
    W: Write,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W> EventSink for JsonLinesEventSink<W>
where
    W: Write,
{
    fn write_entry(&mut self, entry: LogEntry) -> Result<(), Error> {
        serde_json::to_writer(&mut self.writer, &entry)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines() {
        let mut sink = JsonLinesEventSink::new(Vec::new());
        sink.write_entry(LogEntry::AttackPoint(AttackPointRecord {
            info: "memcpy".into(),
            src_info: SrcInfo::default(),
            call_stack: vec![0x4000],
        }))
        .unwrap();
        sink.write_entry(LogEntry::TaintQuery(TaintQueryRecord {
            buf: 0x1000,
            len: 2,
            num_tainted: 1,
            data: vec![0x41, 0],
            src_info: SrcInfo::default(),
            call_stack: Vec::new(),
            taint_query: vec![TaintQueryEntry {
                offset: 0,
                labels: vec![3],
            }],
        }))
        .unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["AttackPoint"]["info"], "memcpy");
        assert_eq!(lines[1]["TaintQuery"]["taint_query"][0]["labels"][0], 3);
    }
}
