//! Early parser for the virtio-iommu topology description.
//!
//! A virtio-iommu transport device can describe the endpoints it translates
//! directly in its device configuration space, for platforms where neither
//! the device tree nor a firmware table carries that information. This crate
//! discovers the transport early -- before generic driver binding, so that
//! endpoint probes find the topology already published -- reads the
//! description through the device's PCI capabilities, and publishes it into
//! the shared topology store.
//!
//! Publication is transactional per transport: either every endpoint item
//! parses and the whole set becomes visible together with the transport's
//! own [`IommuSpec`], or nothing is published at all. The virtio
//! infrastructure is not loaded this early, so the parser performs its own
//! capability walk and region access through the [`VirtioTransport`] seam;
//! all register reads are little-endian regardless of host byte order.

#![no_std]

extern crate alloc;
#[cfg(test)]
#[macro_use] extern crate std;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use log::{debug, info, warn};
use virt_iommu::{DeviceId, DmaDevice, EndpointSpec, IommuSpec, TopologyStore};

/// The PCI vendor id of virtio devices.
pub const VIRTIO_VENDOR_ID: u16 = 0x1af4;
/// The virtio device type of an IOMMU.
pub const VIRTIO_ID_IOMMU: u16 = 23;
/// The PCI device id of a modern virtio-iommu transport.
pub const VIRTIO_IOMMU_DEVICE_ID: u16 = 0x1040 + VIRTIO_ID_IOMMU;

// PCI configuration space registers used by the capability walk.
const PCI_STATUS: u16 = 0x06;
const PCI_CAPABILITIES: u16 = 0x34;
/// Capabilities are only valid if bit 4 of the status register is set.
const STATUS_CAPABILITIES_VALID: u16 = 1 << 4;
const PCI_CAP_ID_VENDOR: u8 = 0x09;
/// The capability list holds at most 48 entries; don't chase cycles.
const CAPABILITY_TTL: usize = 48;

// Field offsets within a virtio PCI vendor capability.
const VIRTIO_CAP_CFG_TYPE: u16 = 3;
const VIRTIO_CAP_BAR: u16 = 4;
const VIRTIO_CAP_OFFSET: u16 = 8;
const VIRTIO_CAP_LENGTH: u16 = 12;

// The capability sub-types this parser cares about.
const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 1;
const VIRTIO_PCI_CAP_DEVICE_CFG: u8 = 4;
const VIRTIO_PCI_CAP_PCI_CFG: u8 = 5;

// Common configuration structure registers.
const COMMON_DEVICE_FEATURE_SELECT: usize = 0x00;
const COMMON_DEVICE_FEATURE: usize = 0x04;

/// Feature bit (in feature word 0) announcing a topology description.
const VIRTIO_IOMMU_F_TOPOLOGY: u32 = 8;

// The topology location pair inside the virtio-iommu device configuration:
// page_size_mask (8) + input_range (16) + domain_range (8) + probe_size (4),
// then { offset: u16, num_items: u16 }.
const CONFIG_TOPO_OFFSET: usize = 36;
const CONFIG_TOPO_NUM_ITEMS: usize = 38;

// Topology item layout: every item starts with
// { type: u8, reserved: u8, length: u16 }.
const TOPO_TYPE: usize = 0;
const TOPO_LENGTH: usize = 2;
const TOPO_HEADER_SIZE: usize = 4;

const VIRTIO_IOMMU_TOPO_PCI_RANGE: u8 = 1;
const VIRTIO_IOMMU_TOPO_MMIO: u8 = 2;

// PCI-range item body.
const PCI_RANGE_ENDPOINT_START: usize = 4;
const PCI_RANGE_SEGMENT: usize = 8;
const PCI_RANGE_BDF_START: usize = 10;
const PCI_RANGE_BDF_END: usize = 12;
const TOPO_PCI_RANGE_SIZE: usize = 16;

// MMIO item body.
const MMIO_ENDPOINT: usize = 4;
const MMIO_ADDRESS: usize = 8;
const TOPO_MMIO_SIZE: usize = 16;

/// A mapped window of live device memory.
///
/// Reads and writes are explicit register accesses, not ordinary memory
/// loads: the region is device state, values are little-endian regardless
/// of host endianness, and accesses happen in program order. Dropping the
/// region unmaps it.
pub trait DeviceRegion {
    /// The size in bytes of the mapped window.
    fn len(&self) -> usize;
    fn read_8(&self, offset: usize) -> u8;
    fn read_16(&self, offset: usize) -> u16;
    fn read_32(&self, offset: usize) -> u32;
    fn write_32(&mut self, offset: usize, value: u32);

    /// Reads a 64-bit register as two 32-bit halves, high half first, for
    /// devices without atomic 64-bit access.
    fn read_64(&self, offset: usize) -> u64 {
        let hi = u64::from(self.read_32(offset + 4));
        let lo = u64::from(self.read_32(offset));
        (hi << 32) | lo
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The seam to a candidate virtio-pci transport device: configuration-space
/// access plus region mapping, on top of the generic [`DmaDevice`] identity.
/// PCI enumeration and MMIO mapping belong to the platform; this parser
/// only drives them.
pub trait VirtioTransport: DmaDevice {
    fn pci_vendor_id(&self) -> u16;
    fn pci_device_id(&self) -> u16;

    fn config_read_8(&self, offset: u16) -> u8;
    fn config_read_16(&self, offset: u16) -> u16;
    fn config_read_32(&self, offset: u16) -> u32;

    /// Enables the device's memory decoding so its regions can be mapped.
    fn enable_memory(&self) -> Result<(), &'static str>;

    /// Maps the memory region behind `bar`.
    fn map_region(&self, bar: u8) -> Result<Box<dyn DeviceRegion>, &'static str>;
}

/// Why a topology parse produced nothing or was thrown away.
///
/// Every variant other than [`TopologyError::Transport`] means the device
/// described something inconsistent; in all cases nothing at all has been
/// published for this transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyError {
    /// An item's offset or declared length leaves the capability window.
    Overflow,
    /// An item's declared length is smaller than its type requires.
    TruncatedItem,
    /// An item type this parser doesn't recognize.
    UnknownItemType,
    /// The platform seam failed (memory enable or region mapping).
    Transport(&'static str),
}

/// The location of one virtio capability structure:
/// which BAR it targets, and the byte window within it.
struct CapConfig {
    bar: u8,
    offset: u32,
    length: u32,
}

/// Walks the PCI capability list for a vendor-specific capability of
/// sub-type `cfg_type`. Capabilities whose target BAR index is outside the
/// valid set are ignored (except for the PCI-access sub-type, which has no
/// BAR of its own).
fn find_vendor_capability<T: VirtioTransport + ?Sized>(dev: &T, cfg_type: u8) -> Option<CapConfig> {
    if dev.config_read_16(PCI_STATUS) & STATUS_CAPABILITIES_VALID == 0 {
        return None;
    }

    let mut cap_addr = u16::from(dev.config_read_8(PCI_CAPABILITIES) & 0xfc);
    for _ in 0..CAPABILITY_TTL {
        if cap_addr == 0 {
            break;
        }
        let cap_header = dev.config_read_16(cap_addr);
        let cap_id = (cap_header & 0xff) as u8;
        let next = (cap_header >> 8) as u8 & 0xfc;

        if cap_id == PCI_CAP_ID_VENDOR {
            let typ = dev.config_read_8(cap_addr + VIRTIO_CAP_CFG_TYPE);
            let bar = dev.config_read_8(cap_addr + VIRTIO_CAP_BAR);
            // Ignore structures with reserved BAR values.
            let bar_ok = typ == VIRTIO_PCI_CAP_PCI_CFG || bar <= 0x5;
            if typ == cfg_type && bar_ok {
                return Some(CapConfig {
                    bar,
                    offset: dev.config_read_32(cap_addr + VIRTIO_CAP_OFFSET),
                    length: dev.config_read_32(cap_addr + VIRTIO_CAP_LENGTH),
                });
            }
        }
        cap_addr = u16::from(next);
    }
    None
}

/// Early device-discovery hook.
///
/// The platform invokes this for every PCI function it discovers, before
/// generic driver binding; anything that is not a virtio-iommu transport is
/// ignored. Parse failures are logged and leave the store untouched -- the
/// affected endpoints simply run with untranslated DMA.
pub fn early_probe<T: VirtioTransport + 'static>(dev: &Arc<T>, store: &TopologyStore) {
    if dev.pci_vendor_id() != VIRTIO_VENDOR_ID || dev.pci_device_id() != VIRTIO_IOMMU_DEVICE_ID {
        return;
    }
    info!("virtio-iommu: parsing topology description");
    match parse_topology(dev, store) {
        Ok(0) => {}
        Ok(count) => info!("virtio-iommu: published {} endpoints", count),
        Err(e) => warn!("virtio-iommu: topology parse failed: {:?}", e),
    }
}

/// Reads the transport's topology description and publishes it.
///
/// Returns the number of endpoints published. A device without the common
/// capability, without the topology feature bit, or with an empty topology
/// location yields `Ok(0)`; that is unavailability, not an error. On any
/// `Err`, nothing has been published.
pub fn parse_topology<T: VirtioTransport + 'static>(
    dev: &Arc<T>,
    store: &TopologyStore,
) -> Result<usize, TopologyError> {
    let Some(cap) = find_vendor_capability(&**dev, VIRTIO_PCI_CAP_COMMON_CFG) else {
        warn!("virtio-iommu: common capability not found");
        return Ok(0);
    };

    dev.enable_memory().map_err(TopologyError::Transport)?;

    // Find out whether the device offers a topology description. The region
    // is only held long enough for the feature read.
    let features = {
        let mut regs = dev.map_region(cap.bar).map_err(TopologyError::Transport)?;
        let common = cap.offset as usize;
        regs.write_32(common + COMMON_DEVICE_FEATURE_SELECT, 0);
        regs.read_32(common + COMMON_DEVICE_FEATURE)
    };
    if features & (1 << VIRTIO_IOMMU_F_TOPOLOGY) == 0 {
        debug!("virtio-iommu: device doesn't have a topology description");
        return Ok(0);
    }

    let Some(cap) = find_vendor_capability(&**dev, VIRTIO_PCI_CAP_DEVICE_CFG) else {
        warn!("virtio-iommu: device config capability not found");
        return Ok(0);
    };

    let regs = dev.map_region(cap.bar).map_err(TopologyError::Transport)?;
    parse_items(dev, &*regs, cap.offset as usize, cap.length as usize, store)
    // The device config region is unmapped here; nothing outlives the parse.
}

/// Walks the topology item list inside the device configuration window and
/// publishes the whole transport, all-or-nothing.
fn parse_items<T: VirtioTransport + 'static>(
    dev: &Arc<T>,
    regs: &dyn DeviceRegion,
    config_base: usize,
    config_len: usize,
    store: &TopologyStore,
) -> Result<usize, TopologyError> {
    // The device config window is bounded both by the capability's declared
    // length and by the mapped region itself.
    let max_len = core::cmp::min(config_len, regs.len().saturating_sub(config_base));
    let mut offset = regs.read_16(config_base + CONFIG_TOPO_OFFSET) as usize;
    let num_items = regs.read_16(config_base + CONFIG_TOPO_NUM_ITEMS) as usize;
    if offset == 0 || num_items == 0 {
        return Ok(0);
    }

    let (segment, bdf) = dev
        .pci_id()
        .ok_or(TopologyError::Transport("transport is not a PCI function"))?;
    // One transport implies one IOMMU; every item below references it.
    let iommu = Arc::new(IommuSpec::with_transport(
        DeviceId::Pci {
            segment,
            bdf_start: bdf,
            bdf_end: bdf,
        },
        dev.clone(),
    ));

    let mut endpoints = Vec::with_capacity(num_items);
    for _ in 0..num_items {
        if offset + TOPO_HEADER_SIZE > max_len {
            return Err(TopologyError::Overflow);
        }
        let item_len = regs.read_16(config_base + offset + TOPO_LENGTH) as usize;
        if offset + item_len > max_len {
            return Err(TopologyError::Overflow);
        }
        endpoints.push(parse_item(regs, config_base + offset, item_len, &iommu)?);
        offset += item_len;
    }

    let count = endpoints.len();
    store.publish_transport(iommu, endpoints);
    Ok(count)
}

/// Decodes one topology item into an endpoint spec.
fn parse_item(
    regs: &dyn DeviceRegion,
    item: usize,
    item_len: usize,
    iommu: &Arc<IommuSpec>,
) -> Result<EndpointSpec, TopologyError> {
    match regs.read_8(item + TOPO_TYPE) {
        VIRTIO_IOMMU_TOPO_PCI_RANGE => {
            if item_len < TOPO_PCI_RANGE_SIZE {
                return Err(TopologyError::TruncatedItem);
            }
            Ok(EndpointSpec::new(
                DeviceId::Pci {
                    segment: regs.read_16(item + PCI_RANGE_SEGMENT),
                    bdf_start: regs.read_16(item + PCI_RANGE_BDF_START),
                    bdf_end: regs.read_16(item + PCI_RANGE_BDF_END),
                },
                regs.read_32(item + PCI_RANGE_ENDPOINT_START),
                iommu.clone(),
            ))
        }
        VIRTIO_IOMMU_TOPO_MMIO => {
            if item_len < TOPO_MMIO_SIZE {
                return Err(TopologyError::TruncatedItem);
            }
            Ok(EndpointSpec::new(
                DeviceId::Mmio {
                    base: regs.read_64(item + MMIO_ADDRESS),
                },
                regs.read_32(item + MMIO_ENDPOINT),
                iommu.clone(),
            ))
        }
        other => {
            warn!("virtio-iommu: unknown topology item type {:#x}", other);
            Err(TopologyError::UnknownItemType)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};
    use std::vec::Vec;
    use virt_iommu::{configure_dma, match_device, DmaConfig, FwnodeRef, IommuOpsRef};

    const COMMON_BAR: u8 = 0;
    const DEVICE_BAR: u8 = 1;
    const COMMON_OFFSET: u32 = 0x800;
    const DEVICE_OFFSET: u32 = 0x40;

    struct FakeState {
        feature_select: u32,
        /// Feature words returned through the common configuration window.
        features: [u32; 2],
        /// Raw contents of the BAR behind the device configuration window.
        device_bar: Vec<u8>,
        memory_enabled: bool,
    }

    struct FakeTransport {
        vendor: u16,
        device: u16,
        segment: u16,
        bdf: u16,
        /// 256-byte PCI configuration space.
        config: Vec<u8>,
        state: StdArc<StdMutex<FakeState>>,
    }

    struct FakeRegion {
        state: StdArc<StdMutex<FakeState>>,
        bar: u8,
    }

    impl DeviceRegion for FakeRegion {
        fn len(&self) -> usize {
            match self.bar {
                COMMON_BAR => 0x1000,
                _ => self.state.lock().unwrap().device_bar.len(),
            }
        }
        fn read_8(&self, offset: usize) -> u8 {
            if self.bar == COMMON_BAR {
                return 0;
            }
            self.state.lock().unwrap().device_bar[offset]
        }
        fn read_16(&self, offset: usize) -> u16 {
            if self.bar == COMMON_BAR {
                return 0;
            }
            let state = self.state.lock().unwrap();
            u16::from_le_bytes(state.device_bar[offset..offset + 2].try_into().unwrap())
        }
        fn read_32(&self, offset: usize) -> u32 {
            let state = self.state.lock().unwrap();
            if self.bar == COMMON_BAR {
                if offset == COMMON_OFFSET as usize + COMMON_DEVICE_FEATURE {
                    return state.features[state.feature_select as usize & 1];
                }
                return 0;
            }
            u32::from_le_bytes(state.device_bar[offset..offset + 4].try_into().unwrap())
        }
        fn write_32(&mut self, offset: usize, value: u32) {
            if self.bar == COMMON_BAR && offset == COMMON_OFFSET as usize + COMMON_DEVICE_FEATURE_SELECT {
                self.state.lock().unwrap().feature_select = value;
            }
        }
    }

    impl DmaDevice for FakeTransport {
        fn pci_id(&self) -> Option<(u16, u16)> {
            Some((self.segment, self.bdf))
        }
        fn init_iommu_fwspec(
            &self,
            _fwnode: Option<FwnodeRef>,
            _ops: IommuOpsRef,
        ) -> Result<(), &'static str> {
            Ok(())
        }
        fn add_iommu_fwspec_ids(&self, _ids: &[u32]) -> Result<(), &'static str> {
            Ok(())
        }
        fn set_up_dma(&self, _dma_base: u64, _dma_limit: u64) {}
    }

    impl VirtioTransport for FakeTransport {
        fn pci_vendor_id(&self) -> u16 {
            self.vendor
        }
        fn pci_device_id(&self) -> u16 {
            self.device
        }
        fn config_read_8(&self, offset: u16) -> u8 {
            self.config[offset as usize]
        }
        fn config_read_16(&self, offset: u16) -> u16 {
            let offset = offset as usize;
            u16::from_le_bytes(self.config[offset..offset + 2].try_into().unwrap())
        }
        fn config_read_32(&self, offset: u16) -> u32 {
            let offset = offset as usize;
            u32::from_le_bytes(self.config[offset..offset + 4].try_into().unwrap())
        }
        fn enable_memory(&self) -> Result<(), &'static str> {
            self.state.lock().unwrap().memory_enabled = true;
            Ok(())
        }
        fn map_region(&self, bar: u8) -> Result<Box<dyn DeviceRegion>, &'static str> {
            if !self.state.lock().unwrap().memory_enabled {
                return Err("memory decoding not enabled");
            }
            Ok(Box::new(FakeRegion {
                state: self.state.clone(),
                bar,
            }))
        }
    }

    /// Builds a config space with a capability list at 0x40 holding the
    /// given virtio vendor capabilities as (cfg_type, bar, offset) triples.
    fn config_space(caps: &[(u8, u8, u32)]) -> Vec<u8> {
        let mut config = vec![0u8; 0x100];
        config[PCI_STATUS as usize..][..2]
            .copy_from_slice(&STATUS_CAPABILITIES_VALID.to_le_bytes());
        let mut addr = 0x40usize;
        config[PCI_CAPABILITIES as usize] = addr as u8;
        for (i, &(cfg_type, bar, offset)) in caps.iter().enumerate() {
            let next = if i + 1 == caps.len() { 0 } else { addr + 0x10 };
            config[addr] = PCI_CAP_ID_VENDOR;
            config[addr + 1] = next as u8;
            config[addr + 2] = 16; // cap_len
            config[addr + 3] = cfg_type;
            config[addr + 4] = bar;
            config[addr + 8..addr + 12].copy_from_slice(&offset.to_le_bytes());
            config[addr + 12..addr + 16].copy_from_slice(&0x1000u32.to_le_bytes());
            addr += 0x10;
        }
        config
    }

    fn pci_range_item(endpoint_start: u32, segment: u16, bdf_start: u16, bdf_end: u16) -> Vec<u8> {
        let mut item = vec![VIRTIO_IOMMU_TOPO_PCI_RANGE, 0];
        item.extend_from_slice(&(TOPO_PCI_RANGE_SIZE as u16).to_le_bytes());
        item.extend_from_slice(&endpoint_start.to_le_bytes());
        item.extend_from_slice(&segment.to_le_bytes());
        item.extend_from_slice(&bdf_start.to_le_bytes());
        item.extend_from_slice(&bdf_end.to_le_bytes());
        item.extend_from_slice(&0u16.to_le_bytes());
        item
    }

    fn mmio_item(endpoint: u32, address: u64) -> Vec<u8> {
        let mut item = vec![VIRTIO_IOMMU_TOPO_MMIO, 0];
        item.extend_from_slice(&(TOPO_MMIO_SIZE as u16).to_le_bytes());
        item.extend_from_slice(&endpoint.to_le_bytes());
        item.extend_from_slice(&address.to_le_bytes());
        item
    }

    /// Lays the virtio-iommu config (with its topology location pair) and
    /// the item list into a device BAR.
    fn device_bar(items: &[Vec<u8>], num_items: u16) -> Vec<u8> {
        let topo_offset = 0x40u16; // relative to the device config window
        let mut bar = vec![0u8; DEVICE_OFFSET as usize + topo_offset as usize];
        let config = DEVICE_OFFSET as usize;
        bar[config + CONFIG_TOPO_OFFSET..][..2].copy_from_slice(&topo_offset.to_le_bytes());
        bar[config + CONFIG_TOPO_NUM_ITEMS..][..2].copy_from_slice(&num_items.to_le_bytes());
        for item in items {
            bar.extend_from_slice(item);
        }
        bar
    }

    fn transport(features: u32, items: &[Vec<u8>], num_items: u16) -> StdArc<FakeTransport> {
        StdArc::new(FakeTransport {
            vendor: VIRTIO_VENDOR_ID,
            device: VIRTIO_IOMMU_DEVICE_ID,
            segment: 0,
            bdf: 0x00f8,
            config: config_space(&[
                (VIRTIO_PCI_CAP_COMMON_CFG, COMMON_BAR, COMMON_OFFSET),
                (VIRTIO_PCI_CAP_DEVICE_CFG, DEVICE_BAR, DEVICE_OFFSET),
            ]),
            state: StdArc::new(StdMutex::new(FakeState {
                feature_select: u32::MAX,
                features: [features, 0],
                device_bar: device_bar(items, num_items),
                memory_enabled: false,
            })),
        })
    }

    #[test]
    fn publishes_whole_transport() {
        let dev = transport(
            1 << VIRTIO_IOMMU_F_TOPOLOGY,
            &[
                pci_range_item(100, 0, 0x0008, 0x000f),
                mmio_item(7, 0xfee0_0000),
            ],
            2,
        );
        let store = TopologyStore::new();
        assert_eq!(parse_topology(&dev, &store), Ok(2));
        assert_eq!(store.iommu_count(), 1);
        assert_eq!(store.endpoint_count(), 2);

        struct Endpoint(u64);
        impl DmaDevice for Endpoint {
            fn mmio_base(&self) -> Option<u64> {
                Some(self.0)
            }
            fn init_iommu_fwspec(
                &self,
                _fwnode: Option<FwnodeRef>,
                _ops: IommuOpsRef,
            ) -> Result<(), &'static str> {
                Ok(())
            }
            fn add_iommu_fwspec_ids(&self, _ids: &[u32]) -> Result<(), &'static str> {
                Ok(())
            }
            fn set_up_dma(&self, _dma_base: u64, _dma_limit: u64) {}
        }

        let ep: Arc<dyn DmaDevice> = Arc::new(Endpoint(0xfee0_0000));
        let (epid, iommu) = match_device(&store, &ep).expect("published endpoint must match");
        assert_eq!(epid, 7);
        // The transport device is bound at creation.
        let transport_dev: Arc<dyn DmaDevice> = dev.clone();
        assert!(iommu
            .transport_device()
            .is_some_and(|t| Arc::ptr_eq(&t, &transport_dev)));
    }

    #[test]
    fn transport_is_not_its_own_endpoint() {
        // The described PCI range covers the transport's own function.
        let dev = transport(
            1 << VIRTIO_IOMMU_F_TOPOLOGY,
            &[pci_range_item(0, 0, 0x0000, 0x00ff)],
            1,
        );
        let store = TopologyStore::new();
        assert_eq!(parse_topology(&dev, &store), Ok(1));

        let as_dma: Arc<dyn DmaDevice> = dev.clone();
        assert!(match_device(&store, &as_dma).is_none());
        assert_eq!(configure_dma(&store, &as_dma), DmaConfig::NoAssociation);
    }

    #[test]
    fn missing_feature_bit_publishes_nothing() {
        let dev = transport(0, &[mmio_item(7, 0xfee0_0000)], 1);
        let store = TopologyStore::new();
        assert_eq!(parse_topology(&dev, &store), Ok(0));
        assert_eq!(store.iommu_count(), 0);
        assert_eq!(store.endpoint_count(), 0);
    }

    #[test]
    fn empty_topology_location_is_benign() {
        let dev = transport(1 << VIRTIO_IOMMU_F_TOPOLOGY, &[], 0);
        let store = TopologyStore::new();
        assert_eq!(parse_topology(&dev, &store), Ok(0));
        assert_eq!(store.endpoint_count(), 0);
    }

    #[test]
    fn item_overflow_discards_everything() {
        // Two items promised, but the window ends after the first.
        let dev = transport(
            1 << VIRTIO_IOMMU_F_TOPOLOGY,
            &[mmio_item(7, 0xfee0_0000)],
            2,
        );
        let store = TopologyStore::new();
        assert_eq!(parse_topology(&dev, &store), Err(TopologyError::Overflow));
        assert_eq!(store.iommu_count(), 0);
        assert_eq!(store.endpoint_count(), 0);
    }

    #[test]
    fn oversized_item_length_discards_everything() {
        let mut item = mmio_item(7, 0xfee0_0000);
        // Declared length runs past the end of the window.
        item[TOPO_LENGTH..TOPO_LENGTH + 2].copy_from_slice(&0x4000u16.to_le_bytes());
        let dev = transport(1 << VIRTIO_IOMMU_F_TOPOLOGY, &[item], 1);
        let store = TopologyStore::new();
        assert_eq!(parse_topology(&dev, &store), Err(TopologyError::Overflow));
        assert_eq!(store.endpoint_count(), 0);
    }

    #[test]
    fn truncated_item_discards_everything() {
        let mut items = vec![mmio_item(7, 0xfee0_0000)];
        // A PCI-range item that declares only 8 bytes.
        let mut short = vec![VIRTIO_IOMMU_TOPO_PCI_RANGE, 0];
        short.extend_from_slice(&8u16.to_le_bytes());
        short.extend_from_slice(&[0u8; 4]);
        items.push(short);
        let dev = transport(1 << VIRTIO_IOMMU_F_TOPOLOGY, &items, 2);
        let store = TopologyStore::new();
        assert_eq!(
            parse_topology(&dev, &store),
            Err(TopologyError::TruncatedItem)
        );
        // The first, valid item is rolled back too.
        assert_eq!(store.iommu_count(), 0);
        assert_eq!(store.endpoint_count(), 0);
    }

    #[test]
    fn unknown_item_type_discards_everything() {
        let mut bogus = vec![0x77u8, 0];
        bogus.extend_from_slice(&16u16.to_le_bytes());
        bogus.extend_from_slice(&[0u8; 12]);
        let dev = transport(
            1 << VIRTIO_IOMMU_F_TOPOLOGY,
            &[mmio_item(7, 0xfee0_0000), bogus],
            2,
        );
        let store = TopologyStore::new();
        assert_eq!(
            parse_topology(&dev, &store),
            Err(TopologyError::UnknownItemType)
        );
        assert_eq!(store.endpoint_count(), 0);
    }

    #[test]
    fn early_probe_ignores_other_devices() {
        let mut dev = transport(1 << VIRTIO_IOMMU_F_TOPOLOGY, &[mmio_item(7, 0x1000)], 1);
        StdArc::get_mut(&mut dev).unwrap().device = 0x1041; // virtio-net
        let store = TopologyStore::new();
        early_probe(&dev, &store);
        assert_eq!(store.endpoint_count(), 0);
    }

    #[test]
    fn reserved_bar_capability_is_ignored() {
        let mut dev = transport(1 << VIRTIO_IOMMU_F_TOPOLOGY, &[mmio_item(7, 0x1000)], 1);
        {
            let inner = StdArc::get_mut(&mut dev).unwrap();
            inner.config = config_space(&[
                (VIRTIO_PCI_CAP_COMMON_CFG, 6, COMMON_OFFSET),
                (VIRTIO_PCI_CAP_DEVICE_CFG, DEVICE_BAR, DEVICE_OFFSET),
            ]);
        }
        let store = TopologyStore::new();
        // The only common capability targets a reserved BAR index.
        assert_eq!(parse_topology(&dev, &store), Ok(0));
        assert_eq!(store.endpoint_count(), 0);
    }

    #[test]
    fn device_without_capability_list_is_skipped() {
        let mut dev = transport(1 << VIRTIO_IOMMU_F_TOPOLOGY, &[], 0);
        StdArc::get_mut(&mut dev).unwrap().config = vec![0u8; 0x100];
        let store = TopologyStore::new();
        assert_eq!(parse_topology(&dev, &store), Ok(0));
    }
}
