//! Kernel bridge-FDB programming interface.
//!
//! The engine talks to the kernel through this trait so the event-handling
//! logic stays testable. The production implementation issues typed
//! RTM_NEWNEIGH/RTM_DELNEIGH requests; kernel rejections are logged by the
//! caller and the database remains authoritative.

use sonic_netlink::{FdbDest, FdbEntryType, KernelFdbWriter, NetlinkResult};
use sonic_types::MacAddress;
use std::net::Ipv4Addr;

/// Serialized kernel FDB command interface; each call blocks until the
/// kernel acks.
pub trait KernelFdb: Send {
    /// Installs or refreshes a locally learned MAC on its bridge port
    /// (`bridge fdb replace <mac> dev <port> master <type> vlan <id>`).
    fn replace_local(
        &mut self,
        mac: &MacAddress,
        vlan: u16,
        port: &str,
        entry_type: FdbEntryType,
    ) -> NetlinkResult<()>;

    /// Removes a locally learned MAC from its bridge port.
    fn del_local(&mut self, mac: &MacAddress, vlan: u16, port: &str) -> NetlinkResult<()>;

    /// Removes a remote MAC from a VXLAN netdevice
    /// (`bridge fdb del <mac> dev <ifname> dst <vtep> vlan <id>`).
    fn del_remote(
        &mut self,
        mac: &MacAddress,
        vlan: u16,
        ifname: &str,
        vtep: Ipv4Addr,
    ) -> NetlinkResult<()>;
}

/// Production implementation over the typed netlink writer.
pub struct NetlinkKernelFdb {
    writer: KernelFdbWriter,
}

impl NetlinkKernelFdb {
    pub fn new() -> NetlinkResult<Self> {
        Ok(Self {
            writer: KernelFdbWriter::new()?,
        })
    }
}

impl KernelFdb for NetlinkKernelFdb {
    fn replace_local(
        &mut self,
        mac: &MacAddress,
        vlan: u16,
        port: &str,
        entry_type: FdbEntryType,
    ) -> NetlinkResult<()> {
        self.writer.replace(
            mac,
            vlan,
            &FdbDest::Master {
                port: port.to_string(),
            },
            entry_type,
        )
    }

    fn del_local(&mut self, mac: &MacAddress, vlan: u16, port: &str) -> NetlinkResult<()> {
        self.writer.del(
            mac,
            vlan,
            &FdbDest::Master {
                port: port.to_string(),
            },
        )
    }

    fn del_remote(
        &mut self,
        mac: &MacAddress,
        vlan: u16,
        ifname: &str,
        vtep: Ipv4Addr,
    ) -> NetlinkResult<()> {
        self.writer.del(
            mac,
            vlan,
            &FdbDest::Vtep {
                ifname: ifname.to_string(),
                vtep,
            },
        )
    }
}

pub mod testing {
    //! Recording double used by the engine and integration tests.

    use super::*;
    use std::sync::{Arc, Mutex};

    /// One recorded kernel call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum KernelOp {
        ReplaceLocal {
            mac: String,
            vlan: u16,
            port: String,
            entry_type: FdbEntryType,
        },
        DelLocal {
            mac: String,
            vlan: u16,
            port: String,
        },
        DelRemote {
            mac: String,
            vlan: u16,
            ifname: String,
            vtep: Ipv4Addr,
        },
    }

    /// Shared log of kernel calls.
    pub type KernelLog = Arc<Mutex<Vec<KernelOp>>>;

    /// `KernelFdb` double that records every call.
    pub struct RecordingKernelFdb {
        pub log: KernelLog,
    }

    impl RecordingKernelFdb {
        pub fn new() -> (Self, KernelLog) {
            let log: KernelLog = Arc::default();
            (Self { log: log.clone() }, log)
        }
    }

    impl KernelFdb for RecordingKernelFdb {
        fn replace_local(
            &mut self,
            mac: &MacAddress,
            vlan: u16,
            port: &str,
            entry_type: FdbEntryType,
        ) -> NetlinkResult<()> {
            self.log.lock().expect("kernel log poisoned").push(KernelOp::ReplaceLocal {
                mac: mac.to_string(),
                vlan,
                port: port.to_string(),
                entry_type,
            });
            Ok(())
        }

        fn del_local(&mut self, mac: &MacAddress, vlan: u16, port: &str) -> NetlinkResult<()> {
            self.log.lock().expect("kernel log poisoned").push(KernelOp::DelLocal {
                mac: mac.to_string(),
                vlan,
                port: port.to_string(),
            });
            Ok(())
        }

        fn del_remote(
            &mut self,
            mac: &MacAddress,
            vlan: u16,
            ifname: &str,
            vtep: Ipv4Addr,
        ) -> NetlinkResult<()> {
            self.log.lock().expect("kernel log poisoned").push(KernelOp::DelRemote {
                mac: mac.to_string(),
                vlan,
                ifname: ifname.to_string(),
                vtep,
            });
            Ok(())
        }
    }
}
