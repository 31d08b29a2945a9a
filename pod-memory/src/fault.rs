//! Entry points for the collaborators around the translation layer
//!
//! The CPU virtualization layer reports nested page faults through
//! [`on_nested_fault`]; the VM lifecycle, clone creation and balloon
//! collaborators use the `address_space_*` functions and [`zero_share`].

extern crate alloc;

use alloc::sync::Arc;

use pod_api::{Error, FaultKind, Gfn, GfnRange, Mapping, Result};

use crate::address_space::AddressSpace;
use crate::config::PodConfig;
use crate::host::HostContext;
use crate::pod::ZeroShareOutcome;

/// Handles a nested page fault raised by a VCPU of `space`.
///
/// Faults on lazy frames are populated on demand. Faults on frames that are
/// already mapped with the required access succeed without change, since a
/// concurrent fault may have resolved them first.
pub fn on_nested_fault(space: &AddressSpace, gfn: Gfn, kind: FaultKind) -> Result<()> {
    let entry = space.get(gfn)?;
    if entry.is_invalid() {
        return Err(Error::NotMapped(gfn));
    }
    if kind != FaultKind::ConfirmZero && !entry.access.contains(kind.required_access()) {
        return Err(Error::AccessDenied(gfn));
    }
    match entry.mapping {
        Mapping::Lazy(_) => space.demand_populate(gfn, kind),
        _ => Ok(()),
    }
}

/// Creates an empty address space for a new VM
pub fn address_space_create(
    host: &Arc<HostContext>,
    config: PodConfig,
) -> Result<Arc<AddressSpace>> {
    AddressSpace::new(host, config)
}

/// Declares `range` populate-on-demand at VM build time
pub fn address_space_declare_lazy(space: &AddressSpace, range: GfnRange) -> Result<()> {
    space.declare_lazy(range)
}

/// Tears down a VM's address space.
///
/// The VM lifecycle collaborator must have stopped every VCPU of the VM.
pub fn address_space_teardown(space: &AddressSpace) -> Result<()> {
    space.teardown()
}

/// Makes `space` a clone of `template`
pub fn address_space_attach_template(
    space: &AddressSpace,
    template: &Arc<AddressSpace>,
) -> Result<()> {
    space.attach_template(template)
}

/// Opportunistically reclaims an idle frame to the zero frame
pub fn zero_share(space: &AddressSpace, gfn: Gfn) -> Result<ZeroShareOutcome> {
    space.zero_share(gfn)
}
