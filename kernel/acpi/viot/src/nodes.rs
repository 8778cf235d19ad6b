//! Fixed-layout definitions for the nodes of the VIOT table.
//!
//! Every node begins with a [`ViotNodeHeader`]; the `length` field there is
//! the full self-declared size of the node, which is how the parser advances
//! from one node to the next. All fields are native-endian.

use super::*;

/// The type values a [`ViotNodeHeader`] can carry.
pub(crate) const VIOT_NODE_PCI_RANGE: u8 = 1;
pub(crate) const VIOT_NODE_MMIO: u8 = 2;
pub(crate) const VIOT_NODE_VIRTIO_IOMMU_PCI: u8 = 3;
pub(crate) const VIOT_NODE_VIRTIO_IOMMU_MMIO: u8 = 4;

/// The common header at the start of every VIOT node.
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ViotNodeHeader {
    pub typ: u8,
    pub reserved: u8,
    /// The full size in bytes of this node, header included.
    pub length: u16,
}
const _: () = assert!(core::mem::size_of::<ViotNodeHeader>() == 4);
const _: () = assert!(core::mem::align_of::<ViotNodeHeader>() == 1);

/// An endpoint node covering an inclusive range of PCI functions.
///
/// Endpoint ids are contiguous across the range, starting at
/// `endpoint_start` for `bdf_start`. `output_node` is the byte offset (from
/// the start of the table) of the virtio-IOMMU node that translates this
/// range.
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ViotPciRange {
    pub header: ViotNodeHeader,
    pub endpoint_start: u32,
    pub segment: u16,
    pub bdf_start: u16,
    pub bdf_end: u16,
    pub output_node: u16,
}
const _: () = assert!(core::mem::size_of::<ViotPciRange>() == 16);
const _: () = assert!(core::mem::align_of::<ViotPciRange>() == 1);

/// An endpoint node for a single memory-mapped platform device,
/// identified by the physical base address of its memory region.
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ViotMmio {
    pub header: ViotNodeHeader,
    pub endpoint: u32,
    pub base_address: u64,
    pub output_node: u16,
    pub reserved: u16,
}
const _: () = assert!(core::mem::size_of::<ViotMmio>() == 20);
const _: () = assert!(core::mem::align_of::<ViotMmio>() == 1);

/// A virtio-IOMMU whose transport is a PCI function.
/// Only ever referenced through an endpoint node's `output_node`.
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ViotVirtioIommuPci {
    pub header: ViotNodeHeader,
    pub segment: u16,
    pub bdf: u16,
}
const _: () = assert!(core::mem::size_of::<ViotVirtioIommuPci>() == 8);
const _: () = assert!(core::mem::align_of::<ViotVirtioIommuPci>() == 1);

/// A virtio-IOMMU whose transport is a memory-mapped device.
/// Only ever referenced through an endpoint node's `output_node`.
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ViotVirtioIommuMmio {
    pub header: ViotNodeHeader,
    pub reserved: u32,
    pub base_address: u64,
}
const _: () = assert!(core::mem::size_of::<ViotVirtioIommuMmio>() == 16);
const _: () = assert!(core::mem::align_of::<ViotVirtioIommuMmio>() == 1);
