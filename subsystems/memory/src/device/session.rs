//! # Device Sessions
//!
//! A session is one process's tenancy in the device address space. Opening
//! one registers the process for an ASID; a session may also carry a
//! preallocated area that mirrors part of the process heap into device
//! space for its whole lifetime.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use guestmem_hal::{DeviceAddr, VirtAddr};
use hashbrown::HashMap;
use log::{debug, info};
use spin::Mutex;

use super::translator::{Asid, DeviceAddressTranslator, ProcessMemory};
use crate::{MemError, MemResult};

/// Session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

#[derive(Debug, Clone, Copy)]
struct PreallocatedArea {
    device_address: DeviceAddr,
    size: u64,
}

struct Session {
    asid: Asid,
    area: Option<PreallocatedArea>,
    _process: Weak<dyn ProcessMemory>,
}

/// Open device sessions, keyed by id
pub struct SessionManager {
    translator: Arc<DeviceAddressTranslator>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_id: AtomicU32,
}

impl SessionManager {
    /// Create a manager issuing sessions on `translator`
    pub fn new(translator: Arc<DeviceAddressTranslator>) -> Self {
        Self { translator, sessions: Mutex::new(HashMap::new()), next_id: AtomicU32::new(1) }
    }

    /// Translator the sessions live in
    pub fn translator(&self) -> &Arc<DeviceAddressTranslator> {
        &self.translator
    }

    fn insert(&self, session: Session) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.lock().insert(id, session);
        id
    }

    /// Open a session without a preallocated area
    pub fn open_session(&self, process: Weak<dyn ProcessMemory>) -> MemResult<SessionId> {
        let asid = self.translator.register_process(process.clone())?;
        let id = self.insert(Session { asid, area: None, _process: process });
        debug!("Opened device session {} asid={}", id.0, asid.0);
        Ok(id)
    }

    /// Open a session whose process range `[vaddr, vaddr + size)` is mapped
    /// into a freshly allocated device range until the session closes
    pub fn open_session_with_area(
        &self,
        process: Weak<dyn ProcessMemory>,
        vaddr: VirtAddr,
        size: u64,
    ) -> MemResult<SessionId> {
        if size == 0 {
            return Err(MemError::InvalidSize);
        }
        let asid = self.translator.register_process(process.clone())?;
        let device_address = match self.translator.allocate(size) {
            Ok(address) => address,
            Err(err) => {
                self.translator.unregister_process(asid)?;
                return Err(err);
            }
        };
        self.translator.map(device_address, vaddr, size, asid, true);

        let area = PreallocatedArea { device_address, size };
        let id = self.insert(Session { asid, area: Some(area), _process: process });
        info!(
            "Opened device session {} asid={} with area {:#x}+{:#x} at device {:#x}",
            id.0, asid.0, vaddr, size, device_address
        );
        Ok(id)
    }

    /// Close a session, unmapping and freeing its area and releasing the ASID
    pub fn close_session(&self, id: SessionId) -> MemResult<()> {
        let session = self.sessions.lock().remove(&id).ok_or(MemError::InvalidHandle)?;
        if let Some(area) = session.area {
            self.translator.unmap(area.device_address, area.size);
            self.translator.free(area.device_address, area.size);
        }
        self.translator.unregister_process(session.asid)?;
        debug!("Closed device session {} asid={}", id.0, session.asid.0);
        Ok(())
    }

    /// ASID of an open session
    pub fn session_asid(&self, id: SessionId) -> Option<Asid> {
        self.sessions.lock().get(&id).map(|session| session.asid)
    }

    /// Device address of an open session's preallocated area
    pub fn session_area(&self, id: SessionId) -> Option<DeviceAddr> {
        self.sessions.lock().get(&id)?.area.map(|area| area.device_address)
    }

    /// Number of open sessions
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceTranslatorConfig;
    use guestmem_hal::{HostMemory, PhysAddr, PAGE_SIZE};

    struct LinearProcess;

    impl ProcessMemory for LinearProcess {
        fn physical_address(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
            (vaddr.as_u64() < 16 * PAGE_SIZE).then(|| PhysAddr::from_dram_offset(vaddr.as_u64()))
        }

        fn mark_region_cached(&self, _vaddr: VirtAddr, _size: u64, _cached: bool) {}
    }

    fn manager() -> SessionManager {
        let host = Arc::new(HostMemory::new(16 * PAGE_SIZE, 0).unwrap());
        let config = DeviceTranslatorConfig { device_virtual_bits: 24, max_processes: 2 };
        SessionManager::new(Arc::new(DeviceAddressTranslator::new(config, host).unwrap()))
    }

    #[test]
    fn test_session_with_area_maps_and_unmaps() {
        let sessions = manager();
        let process: Arc<dyn ProcessMemory> = Arc::new(LinearProcess);
        let id = sessions
            .open_session_with_area(Arc::downgrade(&process), VirtAddr::new(2 * PAGE_SIZE), 4 * PAGE_SIZE)
            .unwrap();

        let area = sessions.session_area(id).unwrap();
        let translator = sessions.translator().clone();
        assert_eq!(
            translator.get_span(area, 4 * PAGE_SIZE),
            Some(PhysAddr::from_dram_offset(2 * PAGE_SIZE))
        );

        sessions.close_session(id).unwrap();
        assert!(translator.physical_address(area).is_none());
        assert_eq!(sessions.close_session(id), Err(MemError::InvalidHandle));
        assert_eq!(sessions.open_sessions(), 0);
    }

    #[test]
    fn test_sessions_bounded_by_asids() {
        let sessions = manager();
        let process: Arc<dyn ProcessMemory> = Arc::new(LinearProcess);
        let first = sessions.open_session(Arc::downgrade(&process)).unwrap();
        let second = sessions.open_session(Arc::downgrade(&process)).unwrap();
        assert_ne!(sessions.session_asid(first), sessions.session_asid(second));
        assert_eq!(
            sessions.open_session(Arc::downgrade(&process)),
            Err(MemError::LimitReached)
        );

        sessions.close_session(first).unwrap();
        assert!(sessions.open_session(Arc::downgrade(&process)).is_ok());
    }
}
