use anyhow::{bail, Result};
use serde::Serialize;

use crate::{consts, error::Error, message::NetlinkRouteAttr};

/// An ethernet bridge device.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    pub vlan_aware: bool,
}

impl Bridge {
    pub(crate) fn marshal(&self) -> NetlinkRouteAttr {
        let mut data = NetlinkRouteAttr::new(consts::IFLA_INFO_DATA, vec![]);

        if self.vlan_aware {
            data.add_child(consts::IFLA_BR_VLAN_FILTERING, vec![1]);
        }

        data
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut bridge = Bridge::default();

        for attr in NetlinkRouteAttr::from(buf)? {
            if attr.rta_type() == consts::IFLA_BR_VLAN_FILTERING {
                bridge.vlan_aware = attr.as_u8()? > 0;
            }
        }

        Ok(bridge)
    }

    pub fn satisfies(&self, spec: &Bridge) -> bool {
        !spec.vlan_aware || self.vlan_aware
    }
}

/// One VLAN membership entry of a bridge port, kernel layout
/// (include/uapi/linux/if_bridge.h, flags before vid).
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, Serialize, PartialEq, Eq)]
pub struct BridgeVlanInfo {
    pub flags: u16,
    pub vid: u16,
}

impl BridgeVlanInfo {
    pub fn new(vid: u16, flags: u16) -> Self {
        Self { flags, vid }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| e.into())
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            bail!(Error::Truncated {
                expected: 4,
                actual: buf.len(),
            });
        }
        Ok(Self {
            flags: u16::from_ne_bytes(buf[..2].try_into()?),
            vid: u16::from_ne_bytes(buf[2..4].try_into()?),
        })
    }

    pub fn is_pvid(&self) -> bool {
        self.flags & consts::BRIDGE_VLAN_INFO_PVID != 0
    }

    pub fn is_untagged(&self) -> bool {
        self.flags & consts::BRIDGE_VLAN_INFO_UNTAGGED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::NetlinkRequestData;

    #[test]
    fn test_marshal_vlan_aware() {
        let bridge = Bridge { vlan_aware: true };
        let buf = bridge.marshal().serialize().unwrap();

        let data = NetlinkRouteAttr::from(&buf).unwrap();
        let children = data[0].nested().unwrap();
        assert_eq!(children[0].rta_type(), consts::IFLA_BR_VLAN_FILTERING);
        assert_eq!(children[0].as_u8().unwrap(), 1);

        let back = Bridge::unmarshal(&data[0].value).unwrap();
        assert!(back.vlan_aware);
    }

    #[test]
    fn test_marshal_plain_bridge_has_empty_data() {
        let bridge = Bridge { vlan_aware: false };
        let buf = bridge.marshal().serialize().unwrap();

        let data = NetlinkRouteAttr::from(&buf).unwrap();
        assert!(data[0].value.is_empty());
    }

    #[test]
    fn test_vlan_info_layout() {
        let entry = BridgeVlanInfo::new(
            10,
            consts::BRIDGE_VLAN_INFO_PVID | consts::BRIDGE_VLAN_INFO_UNTAGGED,
        );

        let buf = entry.serialize().unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(&buf[..2], &0x6u16.to_ne_bytes());
        assert_eq!(&buf[2..], &10u16.to_ne_bytes());

        let back = BridgeVlanInfo::deserialize(&buf).unwrap();
        assert_eq!(back, entry);
        assert!(back.is_pvid());
        assert!(back.is_untagged());
    }
}
