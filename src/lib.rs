#![cfg_attr(not(test), no_std)]

pub mod low_level;

use core::mem::size_of;
use crate::low_level::{
    checksum16, invalidate_record, BootOutcome, BootReport, FileMeta, FileRecord, FileState,
    FingerprintIndex, NodeId, NodeRecord, NodeState, RecordPools, ScanConfig, ScanEvent,
    ScanStep, Scanner, SectorTable, Storage, FILE_NAME_BYTES,
};

/// The in-memory catalog of a dictionary filesystem, together with the boot
/// scanner that recovers it and the collaborators the scanner drives: a
/// `SectorTable` over `SECTORS` erase sectors, and pools of `NODES` node and
/// `FILES` file slots.
pub struct Dictionary<const SECTORS: usize, const NODES: usize, const FILES: usize> {
    space: SectorTable<SECTORS>,
    pools: RecordPools<NODES, FILES>,
    index: FingerprintIndex<NODES>,
    scanner: Scanner,
    report: Option<BootReport>,
}

impl<const SECTORS: usize, const NODES: usize, const FILES: usize>
    Dictionary<SECTORS, NODES, FILES>
{
    pub fn new(sector_bytes: u32) -> Self {
        Self::with_config(sector_bytes, ScanConfig::default())
    }

    pub fn with_config(sector_bytes: u32, config: ScanConfig) -> Self {
        Self {
            space: SectorTable::new(sector_bytes),
            pools: RecordPools::new(),
            index: FingerprintIndex::new(),
            scanner: Scanner::new(config),
            report: None,
        }
    }

    /// Runs the recovery pass over `storage` to completion and returns the
    /// completion signal's payload.
    ///
    /// This is the event loop around the scanner: each step the scanner
    /// requests is performed against `storage` and its completion fed back
    /// in, so exactly one storage operation is in flight at any point. A
    /// failed operation is reported to the scanner rather than surfaced;
    /// whether that ends the pass is the scanner's retry policy's call.
    ///
    /// The pass runs once; calling `boot` again returns the recorded report.
    pub fn boot<S: Storage>(&mut self, storage: &mut S) -> BootReport {
        if let Some(report) = self.report {
            return report;
        }

        let mut buf = [0u8; size_of::<FileMeta>()];
        let mut step =
            self.scanner
                .resume(&mut self.space, &mut self.pools, &mut self.index, ScanEvent::Ready);

        let report = loop {
            step = match step {
                ScanStep::Read { address, length } => {
                    let dest = &mut buf[..length as usize];
                    let ok = storage.read(address, dest).is_ok();
                    let data = &buf[..length as usize];
                    self.scanner.resume(
                        &mut self.space,
                        &mut self.pools,
                        &mut self.index,
                        ScanEvent::ReadDone { data, ok },
                    )
                }
                ScanStep::Delete { address } => {
                    let ok = invalidate_record(storage, address).is_ok();
                    self.scanner.resume(
                        &mut self.space,
                        &mut self.pools,
                        &mut self.index,
                        ScanEvent::DeleteDone { ok },
                    )
                }
                ScanStep::Booted { nodes, files, outcome } => {
                    break BootReport { nodes, files, outcome };
                }
            };
        };

        match report.outcome {
            BootOutcome::Success => {
                log::debug!("boot scan done: {} nodes, {} files", report.nodes, report.files);
            }
            BootOutcome::Fail(fault) => {
                log::error!("boot scan failed: {:?}", fault);
            }
        }
        self.report = Some(report);
        report
    }

    /// True once the pass has finished and the catalog is idle. A failed
    /// pass never becomes ready: the catalog would be missing records.
    pub fn is_booted(&self) -> bool {
        matches!(
            self.report,
            Some(BootReport { outcome: BootOutcome::Success, .. })
        )
    }

    /// The completion signal's payload, if the pass has finished.
    pub fn report(&self) -> Option<BootReport> {
        self.report
    }

    pub fn node(&self, id: NodeId) -> &NodeRecord {
        self.pools.node(id)
    }

    /// Recovered nodes, in pool order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.pools.nodes().iter().filter(|n| n.state != NodeState::Empty)
    }

    /// Recovered files, in pool order.
    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.pools.files().iter().filter(|f| f.state != FileState::Empty)
    }

    /// Looks a file up by name, using the same padded-name checksum the scan
    /// recorded for it.
    pub fn find_file(&self, name: &[u8]) -> Option<&FileRecord> {
        if name.len() > FILE_NAME_BYTES {
            return None;
        }
        let mut padded = [0u8; FILE_NAME_BYTES];
        padded[..name.len()].copy_from_slice(name);
        let name_crc = checksum16(0, &padded);
        self.files().find(|f| f.name_crc == name_crc)
    }

    /// The space accountant's view of the scanned sectors.
    pub fn space(&self) -> &SectorTable<SECTORS> {
        &self.space
    }
}
