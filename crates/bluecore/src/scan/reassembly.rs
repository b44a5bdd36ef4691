//! Reassembly of fragmented advertising reports

use log::warn;

use crate::gap::LeAddr;
use crate::hci::DataStatus;

/// Outcome of feeding one report fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Assembled {
    /// More fragments are expected
    Pending,
    /// The fragment was discarded
    Dropped,
    /// A whole report, cut short when `truncated` is set
    Done { data: Vec<u8>, truncated: bool },
}

/// Buffer collecting the fragments of one report
#[derive(Debug)]
pub(crate) struct ReportBuf {
    buf: Vec<u8>,
    max: usize,
    in_progress: bool,
    /// Rest of a truncated report is being thrown away
    discarding: bool,
}

impl ReportBuf {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
            in_progress: false,
            discarding: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.in_progress = false;
        self.discarding = false;
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub(crate) fn push(&mut self, status: DataStatus, data: &[u8]) -> Assembled {
        if self.discarding {
            if status != DataStatus::Incomplete {
                self.reset();
            }
            return Assembled::Dropped;
        }

        if self.buf.len() + data.len() > self.max {
            let room = self.max - self.buf.len();
            self.buf.extend_from_slice(&data[..room]);
            let data = std::mem::take(&mut self.buf);
            self.in_progress = status == DataStatus::Incomplete;
            self.discarding = self.in_progress;
            return Assembled::Done {
                data,
                truncated: true,
            };
        }

        self.buf.extend_from_slice(data);
        match status {
            DataStatus::Incomplete => {
                self.in_progress = true;
                Assembled::Pending
            }
            DataStatus::Complete | DataStatus::Truncated => {
                let data = std::mem::take(&mut self.buf);
                self.in_progress = false;
                Assembled::Done {
                    data,
                    truncated: status == DataStatus::Truncated,
                }
            }
        }
    }
}

/// Reassembly of extended advertising reports.
///
/// Only one advertiser, identified by address and SID, is reassembled at a
/// time. Fragments from anyone else meanwhile are dropped.
#[derive(Debug)]
pub(crate) struct ExtReassembly {
    report: ReportBuf,
    source: Option<(LeAddr, u8)>,
}

impl ExtReassembly {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            report: ReportBuf::new(max),
            source: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.report.reset();
        self.source = None;
    }

    pub(crate) fn push(&mut self, addr: &LeAddr, sid: u8, status: DataStatus, data: &[u8]) -> Assembled {
        if let Some((source, source_sid)) = &self.source {
            if !source.same_device(addr) || *source_sid != sid {
                warn!("Dropping report from {} while reassembling one from {}", addr, source);
                return Assembled::Dropped;
            }
        }
        let assembled = self.report.push(status, data);
        self.source = self.report.in_progress().then_some((*addr, sid));
        assembled
    }
}
