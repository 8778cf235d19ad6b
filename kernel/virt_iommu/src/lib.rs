//! Topology model and device association for paravirtualized IOMMUs.
//!
//! On machines where a hypervisor exposes a virtual IOMMU, the set of devices
//! it translates may be described out-of-band rather than through the device
//! tree or ACPI IORT. This crate owns the shared in-memory model of that
//! topology -- IOMMU specifications and endpoint specifications -- and the
//! matching engine that resolves an arbitrary device to an endpoint id and a
//! set of translation ops.
//!
//! Two independent parsers populate the model during bring-up:
//! * the `viot` crate decodes a firmware-provided table, and
//! * the `virtio_iommu_topology` crate decodes a live capability region
//!   exposed by a virtio-pci transport device.
//!
//! Later, the platform's DMA-configuration path calls [`configure_dma`] once
//! per device, and an IOMMU driver calls [`set_iommu_ops`] when it finishes
//! probing its transport device (or `None` when it unregisters).

#![no_std]

extern crate alloc;
#[cfg(test)]
#[macro_use] extern crate std;

use alloc::{sync::Arc, vec::Vec};
use core::any::Any;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, error};
use spin::Mutex;

/// An opaque reference to a device's firmware description node.
pub type FwnodeRef = Arc<dyn Any + Send + Sync>;

/// A handle to the translation operations supplied by an IOMMU driver.
pub type IommuOpsRef = Arc<dyn IommuOps>;

/// Translation operations implemented by an IOMMU driver.
///
/// The driver that owns a virtual IOMMU's transport device supplies these via
/// [`set_iommu_ops`] once its probe completes. This crate never invokes
/// translation itself; it only hands the ops to matched endpoint devices.
pub trait IommuOps: Send + Sync {
    /// A short name identifying the driver, for log messages.
    fn name(&self) -> &'static str;
}

/// One device as seen by the association engine.
///
/// This is the seam to the platform's generic device model: identity queries
/// for matching, plus the operations [`configure_dma`] performs on a device
/// once an association is resolved.
pub trait DmaDevice: Send + Sync {
    /// The (domain/segment number, encoded bus-device-function) of this
    /// device, if it is a PCI function.
    fn pci_id(&self) -> Option<(u16, u16)> {
        None
    }

    /// The base address of this device's first memory resource, if it is a
    /// memory-mapped platform device.
    fn mmio_base(&self) -> Option<u64> {
        None
    }

    /// The firmware node describing this device, if it has one.
    fn fwnode(&self) -> Option<FwnodeRef> {
        None
    }

    /// Returns `true` if translation ops were already installed on this
    /// device through another mechanism (DT, IORT).
    fn has_iommu_fwspec(&self) -> bool {
        false
    }

    /// Install the owning IOMMU's firmware node and translation ops on this
    /// device's firmware spec.
    fn init_iommu_fwspec(
        &self,
        fwnode: Option<FwnodeRef>,
        ops: IommuOpsRef,
    ) -> Result<(), &'static str>;

    /// Append endpoint ids to this device's firmware spec.
    fn add_iommu_fwspec_ids(&self, ids: &[u32]) -> Result<(), &'static str>;

    /// Returns `true` if the IOMMU core has already run its probe callback
    /// for this device.
    fn iommu_probed(&self) -> bool {
        false
    }

    /// Replay the IOMMU probe callback for this device. Used when the device
    /// probed before its association was known.
    fn replay_iommu_probe(&self) -> Result<(), &'static str> {
        Ok(())
    }

    /// Install DMA addressing parameters covering `[dma_base, dma_limit]`,
    /// assuming full coherence.
    fn set_up_dma(&self, dma_base: u64, dma_limit: u64);
}

/// Identity of an endpoint or of an IOMMU's own transport device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceId {
    /// A PCI function, or an inclusive range of functions on one segment.
    /// `bdf_start` and `bdf_end` are encoded bus/device/function values.
    Pci {
        segment: u16,
        bdf_start: u16,
        bdf_end: u16,
    },
    /// A memory-mapped platform device, identified by the exact physical
    /// base address of its first memory region.
    Mmio { base: u64 },
}

impl DeviceId {
    /// Returns `true` if `dev` is covered by this identity.
    /// Matching is kind-specific: a PCI identity only ever matches a PCI
    /// function, an MMIO identity only a platform device.
    pub fn matches(&self, dev: &dyn DmaDevice) -> bool {
        match *self {
            DeviceId::Pci {
                segment,
                bdf_start,
                bdf_end,
            } => match dev.pci_id() {
                Some((seg, bdf)) => seg == segment && bdf >= bdf_start && bdf <= bdf_end,
                None => false,
            },
            DeviceId::Mmio { base } => dev.mmio_base() == Some(base),
        }
    }
}

/// The mutable part of an [`IommuSpec`]: the handles bound once the owning
/// IOMMU driver probes. `ops` and `fwnode` are set and cleared together.
#[derive(Default)]
struct IommuBinding {
    transport: Option<Arc<dyn DmaDevice>>,
    fwnode: Option<FwnodeRef>,
    ops: Option<IommuOpsRef>,
}

/// Specification of one virtual IOMMU.
///
/// Created by either parser and published into a [`TopologyStore`], where it
/// lives for the remainder of the process. Only [`set_iommu_ops`] mutates it
/// afterwards.
pub struct IommuSpec {
    /// Identity of the IOMMU's own transport device, so that the matcher can
    /// refuse to translate the IOMMU through itself.
    devid: DeviceId,
    binding: Mutex<IommuBinding>,
}

impl IommuSpec {
    /// Creates a spec for an IOMMU whose transport device has not been seen
    /// yet (the firmware-table parser's case).
    pub fn new(devid: DeviceId) -> IommuSpec {
        IommuSpec {
            devid,
            binding: Mutex::new(IommuBinding::default()),
        }
    }

    /// Creates a spec already bound to its transport device
    /// (the capability parser's case).
    pub fn with_transport(devid: DeviceId, transport: Arc<dyn DmaDevice>) -> IommuSpec {
        IommuSpec {
            devid,
            binding: Mutex::new(IommuBinding {
                transport: Some(transport),
                fwnode: None,
                ops: None,
            }),
        }
    }

    /// The identity of this IOMMU's transport device.
    pub fn device_id(&self) -> DeviceId {
        self.devid
    }

    /// The bound transport device, once known.
    pub fn transport_device(&self) -> Option<Arc<dyn DmaDevice>> {
        self.binding.lock().transport.clone()
    }

    /// The bound translation ops, or `None` while the owning driver has not
    /// probed yet.
    pub fn ops(&self) -> Option<IommuOpsRef> {
        self.binding.lock().ops.clone()
    }

    /// The firmware node of the bound transport device.
    /// `Some` exactly when [`IommuSpec::ops`] is `Some`.
    pub fn fwnode(&self) -> Option<FwnodeRef> {
        self.binding.lock().fwnode.clone()
    }
}

/// Specification of one endpoint translated by a virtual IOMMU.
///
/// Published by a parser once fully valid, immutable thereafter. The owning
/// [`IommuSpec`] reference is fixed at creation, so an endpoint is never
/// visible without one.
pub struct EndpointSpec {
    devid: DeviceId,
    /// The id passed to the IOMMU driver to identify this endpoint. For a
    /// PCI range this is the id of `bdf_start`; ids are contiguous across
    /// the range.
    endpoint_id: u32,
    iommu: Arc<IommuSpec>,
}

impl EndpointSpec {
    pub fn new(devid: DeviceId, endpoint_id: u32, iommu: Arc<IommuSpec>) -> EndpointSpec {
        EndpointSpec {
            devid,
            endpoint_id,
            iommu,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.devid
    }

    pub fn endpoint_id(&self) -> u32 {
        self.endpoint_id
    }

    pub fn iommu(&self) -> &Arc<IommuSpec> {
        &self.iommu
    }
}

/// The insertion-ordered sequences guarded by the store lock.
struct StoreInner {
    iommus: Vec<Arc<IommuSpec>>,
    pci_endpoints: Vec<EndpointSpec>,
    mmio_endpoints: Vec<EndpointSpec>,
}

/// The shared topology store: all known IOMMU specs and endpoint specs,
/// behind a single lock.
///
/// Entries are append-only for the lifetime of the process; there is no
/// removal path. The store is an explicit value so tests can operate on
/// isolated instances; the process-wide instance is [`system_topology()`].
pub struct TopologyStore {
    inner: Mutex<StoreInner>,
}

impl TopologyStore {
    pub const fn new() -> TopologyStore {
        TopologyStore {
            inner: Mutex::new(StoreInner {
                iommus: Vec::new(),
                pci_endpoints: Vec::new(),
                mmio_endpoints: Vec::new(),
            }),
        }
    }

    /// Adds an IOMMU specification to the topology.
    /// The store takes ownership; the spec is never removed.
    pub fn add_iommu_spec(&self, spec: Arc<IommuSpec>) {
        self.inner.lock().iommus.push(spec);
    }

    /// Adds an endpoint specification to the topology, routed into the PCI
    /// or MMIO sequence by the kind of its identity.
    pub fn add_endpoint_spec(&self, spec: EndpointSpec) {
        let mut inner = self.inner.lock();
        match spec.devid {
            DeviceId::Pci { .. } => inner.pci_endpoints.push(spec),
            DeviceId::Mmio { .. } => inner.mmio_endpoints.push(spec),
        }
    }

    /// Publishes one transport's entire topology in a single critical
    /// section: the IOMMU spec plus every endpoint spec become visible
    /// together. Used by the capability parser, which is all-or-nothing.
    pub fn publish_transport(&self, iommu: Arc<IommuSpec>, endpoints: Vec<EndpointSpec>) {
        let mut inner = self.inner.lock();
        for ep in endpoints {
            match ep.devid {
                DeviceId::Pci { .. } => inner.pci_endpoints.push(ep),
                DeviceId::Mmio { .. } => inner.mmio_endpoints.push(ep),
            }
        }
        inner.iommus.push(iommu);
    }

    /// The number of IOMMU specs currently published.
    pub fn iommu_count(&self) -> usize {
        self.inner.lock().iommus.len()
    }

    /// The number of endpoint specs currently published (both kinds).
    pub fn endpoint_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.pci_endpoints.len() + inner.mmio_endpoints.len()
    }
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide topology store.
static SYSTEM_TOPOLOGY: TopologyStore = TopologyStore::new();

/// Returns the process-wide topology store that the bring-up parsers and the
/// platform's DMA-configuration path share.
pub fn system_topology() -> &'static TopologyStore {
    &SYSTEM_TOPOLOGY
}

/// Set when a matched PCI endpoint requires platform-level isolation (ACS),
/// so that the virtual IOMMU's view of traffic separation is sound.
/// Bus enumeration consumes this when configuring downstream ports.
static PCI_ACS_REQUESTED: AtomicBool = AtomicBool::new(false);

fn pci_request_acs() {
    PCI_ACS_REQUESTED.store(true, Ordering::Relaxed);
}

/// Returns `true` if any matched PCI endpoint has requested ACS.
pub fn acs_requested() -> bool {
    PCI_ACS_REQUESTED.load(Ordering::Relaxed)
}

/// Resolves `dev` to its endpoint id and owning IOMMU spec.
///
/// Scans the endpoint sequence of `dev`'s kind under the store lock, in
/// registration order, and returns the first match. Returns `None` when no
/// endpoint covers `dev`, and also when the resolved IOMMU turns out to be
/// `dev` itself -- an IOMMU must not attempt to translate its own transport.
///
/// Read-only and idempotent: repeated calls return identical results and
/// mutate nothing.
pub fn match_device(
    store: &TopologyStore,
    dev: &Arc<dyn DmaDevice>,
) -> Option<(u32, Arc<IommuSpec>)> {
    let (endpoint_id, iommu) = {
        let inner = store.inner.lock();
        if let Some((_, bdf)) = dev.pci_id() {
            let ep = inner
                .pci_endpoints
                .iter()
                .find(|ep| ep.devid.matches(&**dev))?;
            // Endpoint ids are contiguous across a PCI range, numbered from
            // the id of `bdf_start`.
            let base = match ep.devid {
                DeviceId::Pci { bdf_start, .. } => bdf_start,
                DeviceId::Mmio { .. } => unreachable!("PCI sequence holds only PCI identities"),
            };
            (ep.endpoint_id + u32::from(bdf - base), ep.iommu.clone())
        } else if dev.mmio_base().is_some() {
            let ep = inner
                .mmio_endpoints
                .iter()
                .find(|ep| ep.devid.matches(&**dev))?;
            (ep.endpoint_id, ep.iommu.clone())
        } else {
            return None;
        }
    };

    // We're not translating ourselves.
    if iommu.devid.matches(&**dev) {
        return None;
    }
    if let Some(transport) = iommu.transport_device() {
        if Arc::ptr_eq(&transport, dev) {
            return None;
        }
    }

    Some((endpoint_id, iommu))
}

/// Binds translation ops to the IOMMU spec whose transport device is `dev`.
///
/// Called by an IOMMU driver once its own transport device finishes probing,
/// or with `None` when the driver unregisters. A spec created by the
/// firmware-table parser has no transport handle yet; the first call whose
/// device identity matches binds it. `ops` and the device's firmware node
/// are installed and cleared together. Idempotent for repeated calls with
/// the same arguments.
pub fn set_iommu_ops(store: &TopologyStore, dev: &Arc<dyn DmaDevice>, ops: Option<IommuOpsRef>) {
    let inner = store.inner.lock();
    for iommu in inner.iommus.iter() {
        let mut binding = iommu.binding.lock();

        // The firmware-table parser doesn't know the transport device;
        // the capability parser does.
        if binding.transport.is_none() && iommu.devid.matches(&**dev) {
            binding.transport = Some(dev.clone());
        }

        let bound_here = binding
            .transport
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, dev));
        if bound_here {
            match ops {
                Some(ref ops) => {
                    binding.fwnode = dev.fwnode();
                    binding.ops = Some(ops.clone());
                }
                None => {
                    binding.fwnode = None;
                    binding.ops = None;
                }
            }
            break;
        }
    }
}

/// Outcome of [`configure_dma`], consumed by the platform's generic
/// DMA-configuration path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaConfig {
    /// Translation ops were installed; the device's DMA goes through its
    /// virtual IOMMU.
    Translated,
    /// No topology entry covers this device; it proceeds through default
    /// DMA configuration. Not an error.
    NoAssociation,
    /// The owning IOMMU driver has not probed yet. The caller should retry
    /// after other devices finish probing; no retry is scheduled internally.
    Deferred,
}

/// Internal resolution result, kept explicit rather than overloading one
/// numeric code across layers.
enum Resolution {
    Resolved(IommuOpsRef),
    Deferred,
    NotFound,
    Failed(&'static str),
}

fn iommu_setup(store: &TopologyStore, dev: &Arc<dyn DmaDevice>) -> Resolution {
    // Already translated through DT or IORT?
    if dev.has_iommu_fwspec() {
        return Resolution::NotFound;
    }

    let Some((endpoint_id, iommu)) = match_device(store, dev) else {
        return Resolution::NotFound;
    };

    // A PCI range managed by the virtual IOMMU means we are the ones who
    // have to request isolation.
    if dev.pci_id().is_some() {
        pci_request_acs();
    }

    let Some(ops) = iommu.ops() else {
        return Resolution::Deferred;
    };

    if let Err(e) = dev.init_iommu_fwspec(iommu.fwnode(), ops.clone()) {
        return Resolution::Failed(e);
    }
    if let Err(e) = dev.add_iommu_fwspec_ids(&[endpoint_id]) {
        return Resolution::Failed(e);
    }
    debug!(
        "virt_iommu: endpoint {} attached to \"{}\"",
        endpoint_id,
        ops.name()
    );
    Resolution::Resolved(ops)
}

/// Configures the DMA of one virtualized device.
///
/// The platform calls this once per device during probe. On a resolved
/// association whose IOMMU driver is ready, this installs the translation
/// ops and endpoint id on the device, replays the IOMMU probe callback if
/// the device missed it, and installs default DMA parameters (full
/// coherence, maximal address width). A failure while installing the ops is
/// logged and the device continues untranslated; it is never fatal.
pub fn configure_dma(store: &TopologyStore, dev: &Arc<dyn DmaDevice>) -> DmaConfig {
    match iommu_setup(store, dev) {
        Resolution::NotFound => DmaConfig::NoAssociation,
        Resolution::Deferred => DmaConfig::Deferred,
        Resolution::Failed(e) => {
            error!("virt_iommu: error while setting up virtual IOMMU: {}", e);
            DmaConfig::NoAssociation
        }
        Resolution::Resolved(_ops) => {
            // If the IOMMU driver missed the initial probe callback for this
            // device, replay it to get things in order.
            if !dev.iommu_probed() {
                if let Err(e) = dev.replay_iommu_probe() {
                    error!("virt_iommu: probe replay failed: {}", e);
                }
            }
            // No finer-grained negotiation is available from this path.
            dev.set_up_dma(0, u64::MAX);
            DmaConfig::Translated
        }
    }
}
