// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::mem::size_of;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned};

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

pub fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in buffer");
    (lv.into_ref(), rest)
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;

/// Header found at the start of every potential record slot.
///
/// The marker in `magic` fully determines how the record is handled; none of
/// the other fields may be trusted until the marker has been classified.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct RecordHeader {
    /// Record disposition marker. See `RecordMagic` for defined values.
    pub magic: U16LE,
    /// Position of this node within its file. Element 0 starts a file and is
    /// followed by a `FileMeta` at the front of its reserved region.
    pub file_element: U16LE,
    /// Checksum of the owning file's (padded) name buffer.
    pub name_crc: U16LE,
    /// Bytes reserved for this record past the header. Data fills the whole
    /// reservation in this filesystem variant.
    pub reserve_length: U16LE,
}

impl RecordHeader {
    /// Size of the header in bytes. This is also the minimal span of any
    /// record, used when stepping over corrupt data.
    pub const SIZE: u32 = size_of::<Self>() as u32;
}

/// Defined values for the `RecordHeader::magic` field.
///
/// The values follow NOR-flash bit-clearing order from the erased state, so a
/// record's marker can be advanced in place without an erase. Anything else
/// read back from flash is corruption.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum RecordMagic {
    /// Erased flash; end of written data for the sector.
    Empty = 0xFFFF,
    /// A write that never finished committing (torn write).
    Constructing = 0xFFFE,
    /// A completed write.
    Valid = 0xFFFC,
    /// A record that was intentionally deleted.
    Invalid = 0xFFF8,
}

/// Width of the on-flash filename buffer. Shorter names are zero-padded.
pub const FILE_NAME_BYTES: usize = 16;

/// Filename metadata stored at the front of a file-starting record's reserved
/// region, immediately after its header.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct FileMeta {
    pub name: [u8; FILE_NAME_BYTES],
}

impl FileMeta {
    pub const SIZE: u32 = size_of::<Self>() as u32;
}

/// Computes the 16-bit checksum used for filename identity (CRC-16/IBM-SDLC
/// seeded with `seed`).
pub fn checksum16(seed: u16, bytes: &[u8]) -> u16 {
    let algo = crc::Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);
    let mut digest = algo.digest_with_initial(seed);
    digest.update(bytes);
    digest.finalize()
}

//////////////////////////////////////////////////////////////////////////////
// Storage device interface.

/// Trait describing the raw flash primitive for the purposes of the boot
/// scan.
///
/// The scanner itself never calls this directly; the driver in the crate root
/// performs each requested operation and feeds the completion back into the
/// scanner as an event, with an `Err` surfacing as a failed completion.
pub trait Storage {
    /// Error type that can be produced during flash accesses.
    type Error;

    /// Reads `dest.len()` bytes starting at `address` into `dest`.
    ///
    /// On failure `dest` may be partially or completely untouched.
    fn read(&self, address: u32, dest: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` starting at `address`. Only used during the boot pass
    /// to advance record markers in place (see `invalidate_record`).
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error>;
}

//////////////////////////////////////////////////////////////////////////////
// Recovered catalog records.

/// Index of a node slot in the allocator's pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeId(pub u16);

/// Index of a file slot in the allocator's pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileId(pub u16);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Slot is free.
    Empty,
    /// Accepted by the scan, waiting for the final link pass.
    Booting,
    /// Linked and live.
    Valid,
    /// Represents space that is consumed but reclaimable.
    Deleted,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileState {
    /// Slot is free.
    Empty,
    /// Fully recovered and linked.
    Idle,
    /// Created by the scan, waiting for the final link pass.
    Booting,
}

/// One physical record, recovered into memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeRecord {
    pub state: NodeState,
    /// Flash address of the record's header.
    pub address: u32,
    pub file_element: u16,
    pub name_crc: u16,
    pub reserve_length: u16,
    /// Equal to `reserve_length` in this filesystem variant.
    pub data_length: u16,
    /// Next node of the same file, filled in by the link pass.
    pub next: Option<NodeId>,
}

impl NodeRecord {
    pub const EMPTY: Self = Self {
        state: NodeState::Empty,
        address: 0,
        file_element: 0,
        name_crc: 0,
        reserve_length: 0,
        data_length: 0,
        next: None,
    };

    fn from_header(address: u32, header: &RecordHeader) -> Self {
        Self {
            state: NodeState::Booting,
            address,
            file_element: header.file_element.get(),
            name_crc: header.name_crc.get(),
            reserve_length: header.reserve_length.get(),
            data_length: header.reserve_length.get(),
            next: None,
        }
    }

    /// A minimal-width placeholder for a record whose header cannot be
    /// trusted. Its span covers the header alone.
    fn unrecognized(address: u32) -> Self {
        Self {
            state: NodeState::Deleted,
            address,
            ..Self::EMPTY
        }
    }

    /// Total flash span of the record, header included.
    pub fn span(&self) -> u32 {
        RecordHeader::SIZE + u32::from(self.reserve_length)
    }
}

/// One logical file, assembled from one or more nodes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileRecord {
    pub state: FileState,
    pub name_crc: u16,
    /// The file's element-0 node.
    pub first_node: Option<NodeId>,
}

impl FileRecord {
    pub const EMPTY: Self = Self {
        state: FileState::Empty,
        name_crc: 0,
        first_node: None,
    };
}

//////////////////////////////////////////////////////////////////////////////
// Collaborator interfaces.

/// Per-sector free-space bookkeeping.
pub trait SpaceAccountant {
    /// Number of erase sectors under management.
    fn sector_count(&self) -> u32;

    /// Address of the next unscanned byte in `sector`. Monotonically
    /// non-decreasing during a scan pass.
    fn write_offset(&self, sector: u32) -> u32;

    /// One past the last address belonging to `sector`.
    fn boundary(&self, sector: u32) -> u32;

    /// Records `node`'s span as consumed, whether live or reclaimable. Every
    /// accepted span must be documented exactly once.
    fn document(&mut self, node: &NodeRecord);
}

/// Fixed-size pools of node and file slots, plus the post-scan linker.
pub trait SlotAllocator {
    fn new_node(&mut self) -> Option<NodeId>;
    fn new_file(&mut self) -> Option<FileId>;
    fn node_mut(&mut self, id: NodeId) -> &mut NodeRecord;
    fn file_mut(&mut self, id: FileId) -> &mut FileRecord;
    fn release_node(&mut self, id: NodeId);

    /// Chains each booting file's nodes into element order and promotes
    /// lifecycle states. Called once, after the last sector is scanned.
    fn link_all(&mut self);
}

/// Detects equivalent already-accepted nodes and keeps the aggregate counts
/// reported at boot completion.
pub trait DuplicateIndex {
    fn has_duplicate(&self, node: &NodeRecord) -> bool;
    fn note_node(&mut self, node: &NodeRecord);
    fn note_file(&mut self);
    fn total_nodes(&self) -> u32;
    fn total_files(&self) -> u32;
}

//////////////////////////////////////////////////////////////////////////////
// Default collaborators.

/// Space accountant over a flat address space divided into `SECTORS` sectors
/// of a fixed byte size.
pub struct SectorTable<const SECTORS: usize> {
    sector_bytes: u32,
    offsets: [u32; SECTORS],
}

impl<const SECTORS: usize> SectorTable<SECTORS> {
    pub fn new(sector_bytes: u32) -> Self {
        let mut offsets = [0u32; SECTORS];
        for (i, offset) in offsets.iter_mut().enumerate() {
            *offset = i as u32 * sector_bytes;
        }
        Self { sector_bytes, offsets }
    }
}

impl<const SECTORS: usize> SpaceAccountant for SectorTable<SECTORS> {
    fn sector_count(&self) -> u32 {
        SECTORS as u32
    }

    fn write_offset(&self, sector: u32) -> u32 {
        self.offsets[sector as usize]
    }

    fn boundary(&self, sector: u32) -> u32 {
        (sector + 1) * self.sector_bytes
    }

    fn document(&mut self, node: &NodeRecord) {
        let sector = node.address / self.sector_bytes;
        let end = node.address + node.span();
        let offset = &mut self.offsets[sector as usize];
        // The write offset never moves backwards within a pass.
        if end > *offset {
            *offset = end;
        }
    }
}

/// Arena allocator: slots are indexed records in fixed arrays, so exhaustion
/// is an ordinary `None` rather than an allocation failure.
pub struct RecordPools<const NODES: usize, const FILES: usize> {
    nodes: [NodeRecord; NODES],
    files: [FileRecord; FILES],
}

impl<const NODES: usize, const FILES: usize> RecordPools<NODES, FILES> {
    pub fn new() -> Self {
        Self {
            nodes: [NodeRecord::EMPTY; NODES],
            files: [FileRecord::EMPTY; FILES],
        }
    }

    pub fn node(&self, id: NodeId) -> &NodeRecord {
        &self.nodes[id.0 as usize]
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }
}

impl<const NODES: usize, const FILES: usize> Default for RecordPools<NODES, FILES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const NODES: usize, const FILES: usize> SlotAllocator for RecordPools<NODES, FILES> {
    fn new_node(&mut self) -> Option<NodeId> {
        let i = self.nodes.iter().position(|n| n.state == NodeState::Empty)?;
        self.nodes[i].state = NodeState::Booting;
        Some(NodeId(i as u16))
    }

    fn new_file(&mut self) -> Option<FileId> {
        let i = self.files.iter().position(|f| f.state == FileState::Empty)?;
        self.files[i].state = FileState::Booting;
        Some(FileId(i as u16))
    }

    fn node_mut(&mut self, id: NodeId) -> &mut NodeRecord {
        &mut self.nodes[id.0 as usize]
    }

    fn file_mut(&mut self, id: FileId) -> &mut FileRecord {
        &mut self.files[id.0 as usize]
    }

    fn release_node(&mut self, id: NodeId) {
        self.nodes[id.0 as usize] = NodeRecord::EMPTY;
    }

    fn link_all(&mut self) {
        for fi in 0..FILES {
            if self.files[fi].state != FileState::Booting {
                continue;
            }
            let first = match self.files[fi].first_node {
                Some(first) => first,
                None => continue,
            };
            let name_crc = self.nodes[first.0 as usize].name_crc;

            // Chain member nodes behind the starting node in element order.
            //
            // TODO: this rescans the pool once per element; if pools grow
            // beyond a few hundred slots the fingerprint index could memoize
            // element positions instead.
            let mut tail = first;
            let mut element: u16 = 1;
            loop {
                let next = self.nodes.iter().position(|n| {
                    n.state == NodeState::Booting
                        && n.name_crc == name_crc
                        && n.file_element == element
                });
                match next {
                    Some(i) => {
                        self.nodes[tail.0 as usize].next = Some(NodeId(i as u16));
                        tail = NodeId(i as u16);
                        element += 1;
                    }
                    None => break,
                }
            }
            self.files[fi].state = FileState::Idle;
        }

        for node in self.nodes.iter_mut() {
            if node.state == NodeState::Booting {
                node.state = NodeState::Valid;
            }
        }
    }
}

/// Computes the fingerprint identifying a node's logical content.
fn node_fingerprint(node: &NodeRecord) -> u64 {
    const FINGERPRINT_KEY: u64 = 0;

    use core::hash::{Hash, Hasher};

    let mut hasher = fnv::FnvHasher::with_key(FINGERPRINT_KEY);
    node.name_crc.hash(&mut hasher);
    node.file_element.hash(&mut hasher);
    hasher.finish()
}

fn node_identity(node: &NodeRecord) -> u32 {
    u32::from(node.name_crc) << 16 | u32::from(node.file_element)
}

/// Duplicate index over FNV-1 fingerprints of accepted nodes. A fingerprint
/// hit is confirmed against the packed identity before it counts as a
/// duplicate.
pub struct FingerprintIndex<const CAP: usize> {
    prints: [u64; CAP],
    identities: [u32; CAP],
    len: usize,
    nodes: u32,
    files: u32,
}

impl<const CAP: usize> FingerprintIndex<CAP> {
    pub fn new() -> Self {
        Self {
            prints: [0; CAP],
            identities: [0; CAP],
            len: 0,
            nodes: 0,
            files: 0,
        }
    }
}

impl<const CAP: usize> Default for FingerprintIndex<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> DuplicateIndex for FingerprintIndex<CAP> {
    fn has_duplicate(&self, node: &NodeRecord) -> bool {
        let print = node_fingerprint(node);
        let identity = node_identity(node);
        (0..self.len)
            .any(|i| self.prints[i] == print && self.identities[i] == identity)
    }

    fn note_node(&mut self, node: &NodeRecord) {
        if self.len < CAP {
            self.prints[self.len] = node_fingerprint(node);
            self.identities[self.len] = node_identity(node);
            self.len += 1;
        }
        self.nodes += 1;
    }

    fn note_file(&mut self) {
        self.files += 1;
    }

    fn total_nodes(&self) -> u32 {
        self.nodes
    }

    fn total_files(&self) -> u32 {
        self.files
    }
}

//////////////////////////////////////////////////////////////////////////////
// Boot scan state machine.

/// Tuning knobs for a scan pass.
#[derive(Copy, Clone, Debug, Default)]
pub struct ScanConfig {
    /// Consecutive-failure budget for a single storage operation. `None`
    /// reissues forever, which is the faithful baseline behavior but will
    /// livelock against a permanently failing device; `Some(n)` turns the
    /// (n+1)-th failure into a `StorageFailed` outcome.
    pub max_read_retries: Option<u32>,
}

/// Where the scanner is within the current record.
#[derive(Copy, Clone, Debug)]
enum ScanState {
    /// Before the system-ready notification, or after a completed pass.
    Idle,
    /// Waiting for the record header at the scan address.
    NodeMeta { node: NodeId },
    /// Waiting for the filename metadata of a file-starting record.
    FileMeta { node: NodeId, file: FileId },
    /// Waiting for the record editor to invalidate the current record.
    Deleting { node: NodeId },
}

/// Completion notifications fed into the scanner.
#[derive(Debug)]
pub enum ScanEvent<'a> {
    /// System-ready: begin the pass at sector 0.
    Ready,
    /// A requested read finished. `data` is only meaningful when `ok`.
    ReadDone { data: &'a [u8], ok: bool },
    /// A requested record invalidation finished.
    DeleteDone { ok: bool },
}

/// The single next operation the driver must perform, or the completion
/// signal ending the pass.
#[derive(Copy, Clone, Debug)]
pub enum ScanStep {
    Read { address: u32, length: u32 },
    Delete { address: u32 },
    Booted { nodes: u32, files: u32, outcome: BootOutcome },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootOutcome {
    Success,
    Fail(BootFault),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootFault {
    /// The node pool ran out of slots mid-scan. The recovered catalog would
    /// be incomplete, so it is never marked ready.
    NodePoolExhausted,
    /// The file pool ran out of slots mid-scan.
    FilePoolExhausted,
    /// A storage operation exceeded its bounded retry budget.
    StorageFailed,
}

/// Payload of the boot completion signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootReport {
    pub nodes: u32,
    pub files: u32,
    pub outcome: BootOutcome,
}

/// The scan context: current position, the record being classified, and the
/// two-phase read sub-state, owned exclusively for the duration of the pass.
///
/// The scanner is driven entirely by completion events. `resume` consumes one
/// event and returns exactly one `ScanStep`; since the next operation is only
/// ever issued from the previous operation's completion, a single operation
/// is outstanding at any time by construction.
pub struct Scanner {
    state: ScanState,
    sector: u32,
    address: u32,
    retries: u32,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            state: ScanState::Idle,
            sector: 0,
            address: 0,
            retries: 0,
            config,
        }
    }

    /// Feeds one completion event into the state machine and returns the next
    /// operation to perform.
    ///
    /// A `Booted` step with a failure outcome deliberately leaves the scanner
    /// in its mid-pass state: the catalog must never look ready after a
    /// partial recovery.
    pub fn resume<A, P, D>(
        &mut self,
        acct: &mut A,
        pools: &mut P,
        index: &mut D,
        event: ScanEvent<'_>,
    ) -> ScanStep
    where
        A: SpaceAccountant,
        P: SlotAllocator,
        D: DuplicateIndex,
    {
        match (self.state, event) {
            (_, ScanEvent::Ready) => {
                self.sector = 0;
                self.address = 0;
                self.retries = 0;
                self.advance(acct, pools, index)
            }
            (ScanState::NodeMeta { node }, ScanEvent::ReadDone { data, ok: true }) => {
                self.classify(acct, pools, index, node, data)
            }
            (ScanState::NodeMeta { .. }, ScanEvent::ReadDone { ok: false, .. }) => {
                let step = ScanStep::Read {
                    address: self.address,
                    length: RecordHeader::SIZE,
                };
                self.retry(index, step)
            }
            (ScanState::FileMeta { node, file }, ScanEvent::ReadDone { data, ok: true }) => {
                self.finish_file(acct, pools, index, node, file, data)
            }
            (ScanState::FileMeta { .. }, ScanEvent::ReadDone { ok: false, .. }) => {
                let step = ScanStep::Read {
                    address: self.address + RecordHeader::SIZE,
                    length: FileMeta::SIZE,
                };
                self.retry(index, step)
            }
            (ScanState::Deleting { node }, ScanEvent::DeleteDone { ok: true }) => {
                pools.release_node(node);
                self.retries = 0;
                self.advance(acct, pools, index)
            }
            (ScanState::Deleting { .. }, ScanEvent::DeleteDone { ok: false }) => {
                let step = ScanStep::Delete { address: self.address };
                self.retry(index, step)
            }
            (state, event) => {
                unreachable!("scan event {:?} cannot occur in state {:?}", event, state)
            }
        }
    }

    /// Finds the next unscanned offset and issues its header read, crossing
    /// sector boundaries as sectors are used up. Once every sector is
    /// exhausted, runs the link pass and signals completion.
    fn advance<A, P, D>(&mut self, acct: &mut A, pools: &mut P, index: &mut D) -> ScanStep
    where
        A: SpaceAccountant,
        P: SlotAllocator,
        D: DuplicateIndex,
    {
        while self.sector < acct.sector_count() {
            let offset = acct.write_offset(self.sector);
            if offset < acct.boundary(self.sector) {
                let node = match pools.new_node() {
                    Some(node) => node,
                    None => {
                        log::error!("node pool exhausted at {:#x}", offset);
                        return self.fail(index, BootFault::NodePoolExhausted);
                    }
                };
                self.address = offset;
                self.retries = 0;
                self.state = ScanState::NodeMeta { node };
                return ScanStep::Read {
                    address: offset,
                    length: RecordHeader::SIZE,
                };
            }
            self.sector += 1;
        }

        pools.link_all();
        self.state = ScanState::Idle;
        ScanStep::Booted {
            nodes: index.total_nodes(),
            files: index.total_files(),
            outcome: BootOutcome::Success,
        }
    }

    /// Dispatches on the header marker of the record at the scan address.
    fn classify<A, P, D>(
        &mut self,
        acct: &mut A,
        pools: &mut P,
        index: &mut D,
        node: NodeId,
        data: &[u8],
    ) -> ScanStep
    where
        A: SpaceAccountant,
        P: SlotAllocator,
        D: DuplicateIndex,
    {
        let (header, _) = cast_prefix::<RecordHeader>(data);

        match RecordMagic::from_u16(header.magic.get()) {
            Some(RecordMagic::Empty) => {
                // End of written data for this sector.
                pools.release_node(node);
                self.sector += 1;
                self.advance(acct, pools, index)
            }
            Some(RecordMagic::Constructing) => {
                // Torn write. Document its span first, so the space cannot be
                // handed out twice, then scrub it from flash.
                let rec = NodeRecord::from_header(self.address, header);
                acct.document(&rec);
                *pools.node_mut(node) = rec;
                log::debug!("torn write at {:#x}, invalidating", rec.address);
                self.retries = 0;
                self.state = ScanState::Deleting { node };
                ScanStep::Delete { address: rec.address }
            }
            Some(RecordMagic::Valid) => {
                let rec = NodeRecord::from_header(self.address, header);
                acct.document(&rec);
                if index.has_duplicate(&rec) {
                    // An equivalent node was accepted earlier in scan order;
                    // the later copy loses.
                    *pools.node_mut(node) = rec;
                    log::debug!("duplicate record at {:#x}, invalidating", rec.address);
                    self.retries = 0;
                    self.state = ScanState::Deleting { node };
                    return ScanStep::Delete { address: rec.address };
                }
                index.note_node(&rec);
                let file_start = rec.file_element == 0;
                *pools.node_mut(node) = rec;
                if file_start {
                    let file = match pools.new_file() {
                        Some(file) => file,
                        None => {
                            log::error!("file pool exhausted at {:#x}", self.address);
                            return self.fail(index, BootFault::FilePoolExhausted);
                        }
                    };
                    self.retries = 0;
                    self.state = ScanState::FileMeta { node, file };
                    ScanStep::Read {
                        address: self.address + RecordHeader::SIZE,
                        length: FileMeta::SIZE,
                    }
                } else {
                    self.advance(acct, pools, index)
                }
            }
            Some(RecordMagic::Invalid) => {
                // Stale deletion marker: consumed but reclaimable space. The
                // slot goes straight back to the pool once accounted.
                let mut rec = NodeRecord::from_header(self.address, header);
                rec.state = NodeState::Deleted;
                acct.document(&rec);
                pools.release_node(node);
                self.advance(acct, pools, index)
            }
            None => {
                // Arbitrary goo. Step over the smallest possible record
                // rather than trusting any length field it claims to have, so
                // nothing hiding behind the garbage is skipped.
                let rec = NodeRecord::unrecognized(self.address);
                acct.document(&rec);
                pools.release_node(node);
                log::debug!("unrecognized marker at {:#x}, stepping minimal span", self.address);
                self.advance(acct, pools, index)
            }
        }
    }

    /// Completes classification of a file-starting record once its filename
    /// metadata has been read.
    fn finish_file<A, P, D>(
        &mut self,
        acct: &mut A,
        pools: &mut P,
        index: &mut D,
        node: NodeId,
        file: FileId,
        data: &[u8],
    ) -> ScanStep
    where
        A: SpaceAccountant,
        P: SlotAllocator,
        D: DuplicateIndex,
    {
        let (meta, _) = cast_prefix::<FileMeta>(data);
        let name_crc = checksum16(0, &meta.name);

        let rec = pools.file_mut(file);
        rec.state = FileState::Booting;
        rec.name_crc = name_crc;
        rec.first_node = Some(node);
        index.note_file();

        self.advance(acct, pools, index)
    }

    fn retry<D: DuplicateIndex>(&mut self, index: &D, step: ScanStep) -> ScanStep {
        self.retries += 1;
        if let Some(limit) = self.config.max_read_retries {
            if self.retries > limit {
                log::error!("storage kept failing at {:#x}, giving up", self.address);
                return self.fail(index, BootFault::StorageFailed);
            }
        }
        log::warn!("storage failure at {:#x}, reissuing", self.address);
        step
    }

    fn fail<D: DuplicateIndex>(&mut self, index: &D, fault: BootFault) -> ScanStep {
        ScanStep::Booted {
            nodes: index.total_nodes(),
            files: index.total_files(),
            outcome: BootOutcome::Fail(fault),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Record construction and repair.

/// Composes a record at `address`: header, then (for a file-starting record)
/// the filename metadata, then the payload. Used by tooling and tests to
/// synthesize flash images; the catalog plays no part in it.
///
/// Returns the address just past the record's reserved span.
pub fn write_record<S: Storage>(
    storage: &mut S,
    address: u32,
    magic: RecordMagic,
    file_element: u16,
    name: &[u8],
    data: &[u8],
) -> Result<u32, S::Error> {
    let mut meta = FileMeta { name: [0; FILE_NAME_BYTES] };
    meta.name
        .get_mut(..name.len())
        .expect("name too long")
        .copy_from_slice(name);

    let meta_bytes = if file_element == 0 { FileMeta::SIZE } else { 0 };
    let reserve = u16::try_from(meta_bytes as usize + data.len())
        .expect("record too long");

    let header = RecordHeader {
        magic: (magic as u16).into(),
        file_element: file_element.into(),
        name_crc: checksum16(0, &meta.name).into(),
        reserve_length: reserve.into(),
    };

    storage.write(address, header.as_bytes())?;
    let mut cursor = address + RecordHeader::SIZE;
    if file_element == 0 {
        storage.write(cursor, meta.as_bytes())?;
        cursor += FileMeta::SIZE;
    }
    if !data.is_empty() {
        storage.write(cursor, data)?;
    }

    Ok(address + RecordHeader::SIZE + u32::from(reserve))
}

/// The record editor's one repair action: advances the marker of the record
/// at `address` to INVALID in place. Markers only ever clear bits, so this
/// needs no erase.
pub fn invalidate_record<S: Storage>(storage: &mut S, address: u32) -> Result<(), S::Error> {
    let marker = (RecordMagic::Invalid as u16).to_le_bytes();
    storage.write(address, &marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dictionary;
    use core::cell::Cell;

    pub struct FakeStorage {
        pub mem: Vec<u8>,
        pub fail_next_reads: Cell<u32>,
        pub fail_all_reads: bool,
        pub writes: u32,
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FakeStorageError;

    impl FakeStorage {
        pub fn erased(bytes: usize) -> Self {
            Self {
                mem: vec![0xFF; bytes],
                fail_next_reads: Cell::new(0),
                fail_all_reads: false,
                writes: 0,
            }
        }

        fn magic_at(&self, address: u32) -> u16 {
            let i = address as usize;
            u16::from_le_bytes([self.mem[i], self.mem[i + 1]])
        }
    }

    impl Storage for FakeStorage {
        type Error = FakeStorageError;

        fn read(&self, address: u32, dest: &mut [u8]) -> Result<(), FakeStorageError> {
            if self.fail_all_reads {
                return Err(FakeStorageError);
            }
            let pending = self.fail_next_reads.get();
            if pending > 0 {
                self.fail_next_reads.set(pending - 1);
                return Err(FakeStorageError);
            }
            let start = address as usize;
            let end = start.checked_add(dest.len()).ok_or(FakeStorageError)?;
            if end > self.mem.len() {
                return Err(FakeStorageError);
            }
            dest.copy_from_slice(&self.mem[start..end]);
            Ok(())
        }

        fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FakeStorageError> {
            let start = address as usize;
            let end = start.checked_add(data.len()).ok_or(FakeStorageError)?;
            if end > self.mem.len() {
                return Err(FakeStorageError);
            }
            self.mem[start..end].copy_from_slice(data);
            self.writes += 1;
            Ok(())
        }
    }

    const SECTOR: u32 = 128;
    type TestDict = Dictionary<4, 8, 4>;

    fn padded(name: &[u8]) -> [u8; FILE_NAME_BYTES] {
        let mut buf = [0u8; FILE_NAME_BYTES];
        buf[..name.len()].copy_from_slice(name);
        buf
    }

    #[test]
    fn record_magic_decoding() {
        assert_eq!(RecordMagic::from_u16(0xFFFF), Some(RecordMagic::Empty));
        assert_eq!(RecordMagic::from_u16(0xFFFE), Some(RecordMagic::Constructing));
        assert_eq!(RecordMagic::from_u16(0xFFFC), Some(RecordMagic::Valid));
        assert_eq!(RecordMagic::from_u16(0xFFF8), Some(RecordMagic::Invalid));
        assert_eq!(RecordMagic::from_u16(0x1234), None);
    }

    #[test]
    fn write_record_layout() {
        let mut flash = FakeStorage::erased(64);
        let end = write_record(&mut flash, 0, RecordMagic::Valid, 0, b"ab", &[0xAA, 0xBB])
            .unwrap();

        // 00  magic
        // 02  file element
        // 04  name crc
        // 06  reserve length
        // 08  filename buffer
        // 18  payload
        assert_eq!(&flash.mem[0..2], &0xFFFC_u16.to_le_bytes());
        assert_eq!(&flash.mem[2..4], &0_u16.to_le_bytes());
        assert_eq!(&flash.mem[4..6], &checksum16(0, &padded(b"ab")).to_le_bytes());
        assert_eq!(&flash.mem[6..8], &18_u16.to_le_bytes());
        assert_eq!(&flash.mem[8..24], &padded(b"ab"));
        assert_eq!(&flash.mem[24..26], &[0xAA, 0xBB]);
        assert_eq!(end, 26);
    }

    #[test]
    fn invalidate_record_overwrites_marker() {
        let mut flash = FakeStorage::erased(64);
        write_record(&mut flash, 0, RecordMagic::Valid, 1, b"x", &[]).unwrap();
        invalidate_record(&mut flash, 0).unwrap();
        assert_eq!(flash.magic_at(0), RecordMagic::Invalid as u16);
    }

    #[test]
    fn sector_table_documents_spans() {
        let mut table = SectorTable::<4>::new(SECTOR);
        assert_eq!(table.sector_count(), 4);
        assert_eq!(table.write_offset(2), 256);
        assert_eq!(table.boundary(2), 384);

        let mut rec = NodeRecord::EMPTY;
        rec.address = 256;
        rec.reserve_length = 20;
        table.document(&rec);
        assert_eq!(table.write_offset(2), 256 + 8 + 20);

        // Re-documenting an earlier span never walks the offset backwards.
        let mut early = NodeRecord::EMPTY;
        early.address = 256;
        table.document(&early);
        assert_eq!(table.write_offset(2), 256 + 8 + 20);
    }

    #[test]
    fn pools_exhaust_and_release() {
        let mut pools = RecordPools::<2, 1>::new();
        let a = pools.new_node().unwrap();
        let _b = pools.new_node().unwrap();
        assert_eq!(pools.new_node(), None);

        pools.release_node(a);
        assert!(pools.new_node().is_some());

        assert!(pools.new_file().is_some());
        assert_eq!(pools.new_file(), None);
    }

    #[test]
    fn fingerprint_index_flags_equivalent_nodes() {
        let mut index = FingerprintIndex::<4>::new();
        let mut rec = NodeRecord::EMPTY;
        rec.name_crc = 0xBEEF;
        rec.file_element = 2;

        assert!(!index.has_duplicate(&rec));
        index.note_node(&rec);
        assert!(index.has_duplicate(&rec));

        let mut other = rec;
        other.file_element = 3;
        assert!(!index.has_duplicate(&other));
        assert_eq!(index.total_nodes(), 1);
    }

    #[test]
    fn boot_empty_flash() {
        let mut flash = FakeStorage::erased(512);
        let mut dict = TestDict::new(SECTOR);
        let report = dict.boot(&mut flash);

        assert_eq!(report, BootReport { nodes: 0, files: 0, outcome: BootOutcome::Success });
        assert!(dict.is_booted());
        // Nothing was allocated along the way.
        assert!(dict.nodes().next().is_none());
        assert!(dict.files().next().is_none());
    }

    #[test]
    fn boot_single_file() {
        let mut flash = FakeStorage::erased(512);
        write_record(&mut flash, 0, RecordMagic::Valid, 0, b"alpha", &[]).unwrap();

        let mut dict = TestDict::new(SECTOR);
        let report = dict.boot(&mut flash);
        assert_eq!(report, BootReport { nodes: 1, files: 1, outcome: BootOutcome::Success });
        assert!(dict.is_booted());

        let file = dict.find_file(b"alpha").expect("file should be recovered");
        assert_eq!(file.state, FileState::Idle);
        assert_eq!(file.name_crc, checksum16(0, &padded(b"alpha")));

        let node = dict.node(file.first_node.unwrap());
        assert_eq!(node.address, 0);
        assert_eq!(node.file_element, 0);
        assert_eq!(node.name_crc, file.name_crc);
        assert_eq!(node.reserve_length, 16);
        assert_eq!(node.data_length, 16);
        assert_eq!(node.state, NodeState::Valid);
    }

    #[test]
    fn boot_invalid_record_accounted_then_freed() {
        let mut flash = FakeStorage::erased(512);
        let end = write_record(&mut flash, 0, RecordMagic::Invalid, 1, b"old", b"data").unwrap();

        let mut dict = TestDict::new(SECTOR);
        let report = dict.boot(&mut flash);
        assert_eq!(report, BootReport { nodes: 0, files: 0, outcome: BootOutcome::Success });

        // The span is still accounted as consumed, but no slot holds it.
        assert_eq!(dict.space().write_offset(0), end);
        assert!(dict.nodes().next().is_none());
    }

    #[test]
    fn boot_torn_write_repaired() {
        let mut flash = FakeStorage::erased(512);
        let end = write_record(&mut flash, 0, RecordMagic::Constructing, 1, b"torn", b"abcd")
            .unwrap();
        flash.writes = 0;

        let mut dict = TestDict::new(SECTOR);
        let report = dict.boot(&mut flash);
        assert_eq!(report, BootReport { nodes: 0, files: 0, outcome: BootOutcome::Success });

        // Documented exactly once, and invalidated on flash in one write.
        assert_eq!(dict.space().write_offset(0), end);
        assert_eq!(flash.writes, 1);
        assert_eq!(flash.magic_at(0), RecordMagic::Invalid as u16);

        // A rescan of the repaired image settles on the same catalog.
        let mut again = TestDict::new(SECTOR);
        assert_eq!(again.boot(&mut flash), report);
    }

    #[test]
    fn boot_duplicate_keeps_first() {
        let mut flash = FakeStorage::erased(512);
        let second = write_record(&mut flash, 0, RecordMagic::Valid, 0, b"alpha", &[]).unwrap();
        write_record(&mut flash, second, RecordMagic::Valid, 0, b"alpha", &[]).unwrap();
        flash.writes = 0;

        let mut dict = TestDict::new(SECTOR);
        let report = dict.boot(&mut flash);
        assert_eq!(report, BootReport { nodes: 1, files: 1, outcome: BootOutcome::Success });

        // The later copy is requested for deletion exactly once; the record
        // accepted first in scan order survives untouched.
        assert_eq!(flash.writes, 1);
        assert_eq!(flash.magic_at(0), RecordMagic::Valid as u16);
        assert_eq!(flash.magic_at(second), RecordMagic::Invalid as u16);

        let file = dict.find_file(b"alpha").unwrap();
        assert_eq!(dict.node(file.first_node.unwrap()).address, 0);
    }

    #[test]
    fn boot_unrecognized_marker_minimal_advance() {
        let mut flash = FakeStorage::erased(512);
        // Garbage header claiming an enormous length; only its minimal span
        // may be stepped over.
        flash.mem[..8].copy_from_slice(&[0xAB, 0xCD, 0x00, 0x00, 0x99, 0x99, 0xF0, 0x0F]);
        let end = write_record(&mut flash, 8, RecordMagic::Valid, 0, b"alpha", &[]).unwrap();

        let mut dict = TestDict::new(SECTOR);
        let report = dict.boot(&mut flash);
        assert_eq!(report, BootReport { nodes: 1, files: 1, outcome: BootOutcome::Success });

        let file = dict.find_file(b"alpha").unwrap();
        assert_eq!(dict.node(file.first_node.unwrap()).address, 8);
        assert_eq!(dict.space().write_offset(0), end);
    }

    #[test]
    fn boot_multi_node_file_links_chain() {
        let mut flash = FakeStorage::erased(512);
        let mid = write_record(&mut flash, 0, RecordMagic::Valid, 0, b"log", b"abcd").unwrap();
        write_record(&mut flash, mid, RecordMagic::Valid, 1, b"log", b"efgh").unwrap();

        let mut dict = TestDict::new(SECTOR);
        let report = dict.boot(&mut flash);
        assert_eq!(report, BootReport { nodes: 2, files: 1, outcome: BootOutcome::Success });

        let file = dict.find_file(b"log").unwrap();
        let first = dict.node(file.first_node.unwrap());
        assert_eq!(first.file_element, 0);

        let second = dict.node(first.next.expect("chain should continue"));
        assert_eq!(second.file_element, 1);
        assert_eq!(second.address, mid);
        assert_eq!(second.state, NodeState::Valid);
        assert_eq!(second.next, None);
    }

    #[test]
    fn boot_node_pool_exhaustion_fails() {
        let mut flash = FakeStorage::erased(512);
        let mid = write_record(&mut flash, 0, RecordMagic::Valid, 0, b"a", &[]).unwrap();
        write_record(&mut flash, mid, RecordMagic::Valid, 0, b"b", &[]).unwrap();

        let mut dict = Dictionary::<4, 1, 4>::new(SECTOR);
        let report = dict.boot(&mut flash);
        assert_eq!(report.outcome, BootOutcome::Fail(BootFault::NodePoolExhausted));
        assert!(!dict.is_booted());
    }

    #[test]
    fn boot_file_pool_exhaustion_fails() {
        let mut flash = FakeStorage::erased(512);
        let mid = write_record(&mut flash, 0, RecordMagic::Valid, 0, b"a", &[]).unwrap();
        write_record(&mut flash, mid, RecordMagic::Valid, 0, b"b", &[]).unwrap();

        let mut dict = Dictionary::<4, 8, 1>::new(SECTOR);
        let report = dict.boot(&mut flash);
        assert_eq!(report.outcome, BootOutcome::Fail(BootFault::FilePoolExhausted));
        assert!(!dict.is_booted());
    }

    #[test]
    fn boot_retries_transient_read_failures() {
        let mut flash = FakeStorage::erased(512);
        write_record(&mut flash, 0, RecordMagic::Valid, 0, b"alpha", &[]).unwrap();
        flash.fail_next_reads.set(3);

        let mut dict = TestDict::new(SECTOR);
        let report = dict.boot(&mut flash);
        assert_eq!(report, BootReport { nodes: 1, files: 1, outcome: BootOutcome::Success });
    }

    #[test]
    fn boot_bounded_retry_reports_failure() {
        let mut flash = FakeStorage::erased(512);
        flash.fail_all_reads = true;

        let config = ScanConfig { max_read_retries: Some(4) };
        let mut dict = TestDict::with_config(SECTOR, config);
        let report = dict.boot(&mut flash);
        assert_eq!(report.outcome, BootOutcome::Fail(BootFault::StorageFailed));
        assert!(!dict.is_booted());
    }

    #[test]
    fn boot_counts_stable_across_rescan() {
        let mut flash = FakeStorage::erased(512);
        let a = write_record(&mut flash, 0, RecordMagic::Valid, 0, b"alpha", b"12").unwrap();
        let b = write_record(&mut flash, a, RecordMagic::Invalid, 3, b"beta", b"x").unwrap();
        write_record(&mut flash, b, RecordMagic::Valid, 0, b"beta", &[]).unwrap();

        let mut first = TestDict::new(SECTOR);
        let r1 = first.boot(&mut flash);
        let mut second = TestDict::new(SECTOR);
        let r2 = second.boot(&mut flash);

        assert_eq!(r1.outcome, BootOutcome::Success);
        assert_eq!(r1, r2);
    }
}
