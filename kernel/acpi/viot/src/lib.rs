//! Support for the VIOT, the Virtual I/O Translation ACPI table.
//!
//! The VIOT describes the topology of paravirtualized IOMMUs: which
//! endpoints (PCI ranges or memory-mapped devices) are translated by which
//! virtio-IOMMU, identified by its own transport device. This parser walks
//! the table's node array once at bring-up and publishes the decoded
//! [`IommuSpec`]s and [`EndpointSpec`]s into the shared topology store,
//! node by node.
//!
//! The table is untrusted input: every node access is bounds-checked against
//! the header-declared table length, and a structural violation abandons the
//! rest of the walk while leaving already-published nodes in place.

#![no_std]

extern crate alloc;
#[cfg(test)]
#[macro_use] extern crate std;

use alloc::{collections::BTreeMap, sync::Arc};
use core::mem::size_of;
use log::{debug, warn};
use sdt::Sdt;
use virt_iommu::{DeviceId, EndpointSpec, IommuSpec, TopologyStore};
use zerocopy::{FromBytes, FromZeroes};

mod nodes;
use nodes::*;

pub const VIOT_SIGNATURE: &[u8; 4] = b"VIOT";

/// The fixed-size part of the VIOT table.
/// Following it is a flat array of variable-sized nodes, which begins at
/// `node_offset` bytes from the start of the table.
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes)]
#[repr(C, packed)]
struct ViotTable {
    header: Sdt,
    node_count: u16,
    node_offset: u16,
    _reserved: [u8; 8],
}
const _: () = assert!(core::mem::size_of::<ViotTable>() == 48);
const _: () = assert!(core::mem::align_of::<ViotTable>() == 1);

/// A structural violation in the VIOT table.
///
/// Any of these abandons the remainder of the node walk; nodes published
/// before the violation are not rolled back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViotError {
    /// The table is shorter than its fixed part, carries the wrong
    /// signature, or its header fields are inconsistent.
    BadHeader,
    /// Node pointer arithmetic left the bounds declared by the header.
    NodeOverflow,
    /// A node's declared length is smaller than its type requires.
    TruncatedNode,
}

/// What became of one successfully bounds-checked node.
enum NodeOutcome {
    /// An endpoint spec was published.
    Published,
    /// The endpoint was discarded (its IOMMU reference didn't resolve);
    /// the walk continues.
    Discarded,
    /// An unrecognized node type: the end of usable topology information.
    EndOfTopology,
}

/// Parses a VIOT table from its raw bytes and publishes the topology it
/// describes into `store`.
///
/// Publication is incremental: each endpoint node becomes visible as soon as
/// it decodes, and a later structural error ([`ViotError`]) does not roll
/// back earlier nodes. An unrecognized node type ends the walk without
/// marking failure. IOMMU nodes are never walked directly; they are decoded
/// lazily the first time an endpoint references them, and memoized by table
/// offset thereafter, so an IOMMU node no endpoint references is never
/// instantiated.
pub fn parse(table: &[u8], store: &TopologyStore) -> Result<(), ViotError> {
    let viot = ViotTable::read_from_prefix(table).ok_or(ViotError::BadHeader)?;
    if &viot.header.signature != VIOT_SIGNATURE {
        return Err(ViotError::BadHeader);
    }
    let table_length = { viot.header.length } as usize;
    if table_length > table.len() {
        return Err(ViotError::BadHeader);
    }
    let node_offset = { viot.node_offset } as usize;
    if node_offset < size_of::<ViotTable>() {
        return Err(ViotError::BadHeader);
    }

    let mut parser = ViotParser {
        table,
        node_offset,
        table_length,
        iommus: BTreeMap::new(),
        store,
    };

    let node_count = { viot.node_count };
    let mut offset = node_offset;
    for _ in 0..node_count {
        let header = parser.check_bounds(offset)?;
        if let NodeOutcome::EndOfTopology = parser.parse_node(offset, header)? {
            return Ok(());
        }
        offset += { header.length } as usize;
    }
    Ok(())
}

struct ViotParser<'t> {
    table: &'t [u8],
    /// Byte offset of the start of the node array.
    node_offset: usize,
    /// The table length declared by the header.
    table_length: usize,
    /// IOMMU nodes already decoded, keyed by their byte offset in the table.
    iommus: BTreeMap<u16, Arc<IommuSpec>>,
    store: &'t TopologyStore,
}

impl ViotParser<'_> {
    /// Verifies that a node starting at `offset` lies within the node array
    /// and declares at least a node header's worth of bytes, then decodes
    /// its header.
    fn check_bounds(&self, offset: usize) -> Result<ViotNodeHeader, ViotError> {
        if offset < self.node_offset || offset >= self.table_length {
            warn!("VIOT: node pointer overflows, bad table");
            return Err(ViotError::NodeOverflow);
        }
        let header = ViotNodeHeader::read_from_prefix(&self.table[offset..])
            .ok_or(ViotError::NodeOverflow)?;
        if ({ header.length } as usize) < size_of::<ViotNodeHeader>() {
            warn!("VIOT: empty node, bad table");
            return Err(ViotError::TruncatedNode);
        }
        Ok(header)
    }

    /// Resolves the IOMMU node at byte offset `offset`, decoding and
    /// publishing it on first reference and reusing the memoized spec on
    /// every later one. Returns `None` when the reference is unusable
    /// (out of bounds, undersized, or not an IOMMU node).
    fn get_iommu(&mut self, offset: u16) -> Option<Arc<IommuSpec>> {
        if let Some(iommu) = self.iommus.get(&offset) {
            return Some(iommu.clone());
        }

        let node_start = offset as usize;
        let header = self.check_bounds(node_start).ok()?;
        let length = { header.length } as usize;

        let devid = match header.typ {
            VIOT_NODE_VIRTIO_IOMMU_PCI => {
                if length < size_of::<ViotVirtioIommuPci>() {
                    return None;
                }
                let node = ViotVirtioIommuPci::read_from_prefix(&self.table[node_start..])?;
                DeviceId::Pci {
                    segment: node.segment,
                    bdf_start: node.bdf,
                    bdf_end: node.bdf,
                }
            }
            VIOT_NODE_VIRTIO_IOMMU_MMIO => {
                if length < size_of::<ViotVirtioIommuMmio>() {
                    return None;
                }
                let node = ViotVirtioIommuMmio::read_from_prefix(&self.table[node_start..])?;
                DeviceId::Mmio {
                    base: node.base_address,
                }
            }
            _ => return None,
        };

        let iommu = Arc::new(IommuSpec::new(devid));
        self.iommus.insert(offset, iommu.clone());
        self.store.add_iommu_spec(iommu.clone());
        Some(iommu)
    }

    /// Decodes one node of the top-level walk, whose header already passed
    /// [`Self::check_bounds`], and publishes the endpoint spec it describes.
    fn parse_node(
        &mut self,
        offset: usize,
        header: ViotNodeHeader,
    ) -> Result<NodeOutcome, ViotError> {
        if header.reserved != 0 {
            warn!("VIOT: unexpected reserved data in node");
        }
        let length = { header.length } as usize;

        let (devid, endpoint_id, output_node) = match header.typ {
            VIOT_NODE_PCI_RANGE => {
                if length < size_of::<ViotPciRange>() {
                    return Err(ViotError::TruncatedNode);
                }
                let node = ViotPciRange::read_from_prefix(&self.table[offset..])
                    .ok_or(ViotError::NodeOverflow)?;
                (
                    DeviceId::Pci {
                        segment: node.segment,
                        bdf_start: node.bdf_start,
                        bdf_end: node.bdf_end,
                    },
                    { node.endpoint_start },
                    { node.output_node },
                )
            }
            VIOT_NODE_MMIO => {
                if length < size_of::<ViotMmio>() {
                    return Err(ViotError::TruncatedNode);
                }
                let node = ViotMmio::read_from_prefix(&self.table[offset..])
                    .ok_or(ViotError::NodeOverflow)?;
                (
                    DeviceId::Mmio {
                        base: node.base_address,
                    },
                    { node.endpoint },
                    { node.output_node },
                )
            }
            // IOMMU nodes are only materialized through `output_node`
            // references; anything else ends the enumeration.
            other => {
                debug!("VIOT: node type {:#x} ends topology enumeration", other);
                return Ok(NodeOutcome::EndOfTopology);
            }
        };

        let Some(iommu) = self.get_iommu(output_node) else {
            warn!(
                "VIOT: discarding endpoint with unresolvable output node {:#x}",
                output_node
            );
            return Ok(NodeOutcome::Discarded);
        };

        self.store
            .add_endpoint_spec(EndpointSpec::new(devid, endpoint_id, iommu));
        Ok(NodeOutcome::Published)
    }
}
