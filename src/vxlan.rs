use std::net::Ipv4Addr;

use anyhow::Result;

use crate::{
    consts,
    message::NetlinkRouteAttr,
    utils::{htons, ntohs, u16_sat, u32_sat},
};

/// A virtual extensible LAN device.
///
/// The local tunnel endpoint is IPv4 only; the destination UDP port is
/// compared in host order here and swapped to network order on the wire.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Vxlan {
    pub vni: u32,
    pub link: u32,
    pub local: Option<Ipv4Addr>,
    pub dst_port: u16,
    pub learning: bool,
}

impl Vxlan {
    pub(crate) fn marshal(&self) -> NetlinkRouteAttr {
        let mut data = NetlinkRouteAttr::new(consts::IFLA_INFO_DATA, vec![]);

        data.add_child(consts::IFLA_VXLAN_ID, self.vni.to_ne_bytes().to_vec());

        if self.link != 0 {
            data.add_child(consts::IFLA_VXLAN_LINK, self.link.to_ne_bytes().to_vec());
        }

        if let Some(local) = self.local {
            data.add_child(consts::IFLA_VXLAN_LOCAL, local.octets().to_vec());
        }

        if self.dst_port != 0 {
            data.add_child(
                consts::IFLA_VXLAN_PORT,
                htons(self.dst_port).to_ne_bytes().to_vec(),
            );
        }

        data.add_child(consts::IFLA_VXLAN_LEARNING, vec![self.learning as u8]);

        data
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut vxlan = Vxlan::default();

        for attr in NetlinkRouteAttr::from(buf)? {
            match attr.rta_type() {
                consts::IFLA_VXLAN_ID => vxlan.vni = attr.as_u32()?,
                consts::IFLA_VXLAN_LINK => vxlan.link = attr.as_u32()?,
                consts::IFLA_VXLAN_LOCAL => {
                    if attr.value.len() == 4 {
                        let octets: [u8; 4] = attr.value[..4].try_into()?;
                        vxlan.local = Some(Ipv4Addr::from(octets));
                    }
                }
                // IPv6 endpoints are unsupported, IFLA_VXLAN_LOCAL6 falls
                // through with the rest
                consts::IFLA_VXLAN_PORT => vxlan.dst_port = ntohs(attr.as_u16()?),
                consts::IFLA_VXLAN_LEARNING => vxlan.learning = attr.as_u8()? != 0,
                _ => {}
            }
        }

        Ok(vxlan)
    }

    pub fn satisfies(&self, spec: &Vxlan) -> bool {
        u32_sat(self.vni, spec.vni)
            && u32_sat(self.link, spec.link)
            && u16_sat(self.dst_port, spec.dst_port)
            && (spec.local.is_none() || self.local == spec.local)
            && (!spec.learning || self.learning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::NetlinkRequestData;

    fn round_trip(vxlan: &Vxlan) -> Vxlan {
        let buf = vxlan.marshal().serialize().unwrap();
        let data = NetlinkRouteAttr::from(&buf).unwrap();
        Vxlan::unmarshal(&data[0].value).unwrap()
    }

    #[test]
    fn test_round_trip_full() {
        let vxlan = Vxlan {
            vni: 47,
            link: 1,
            local: Some(Ipv4Addr::new(1, 2, 3, 4)),
            dst_port: 4789,
            learning: true,
        };

        assert_eq!(round_trip(&vxlan), vxlan);
    }

    #[test]
    fn test_port_network_order_on_wire() {
        let vxlan = Vxlan {
            vni: 47,
            dst_port: 4789,
            ..Default::default()
        };

        let buf = vxlan.marshal().serialize().unwrap();
        let data = NetlinkRouteAttr::from(&buf).unwrap();
        let port = data[0]
            .nested()
            .unwrap()
            .into_iter()
            .find(|a| a.rta_type() == consts::IFLA_VXLAN_PORT)
            .unwrap();

        assert_eq!(port.value, 4789u16.to_be_bytes().to_vec());
    }

    #[test]
    fn test_satisfies() {
        let vxlan = Vxlan {
            vni: 47,
            link: 1,
            local: Some(Ipv4Addr::new(1, 2, 3, 4)),
            dst_port: 4789,
            learning: false,
        };

        assert!(vxlan.satisfies(&Vxlan::default()));
        assert!(vxlan.satisfies(&Vxlan {
            vni: 47,
            ..Default::default()
        }));
        assert!(!vxlan.satisfies(&Vxlan {
            vni: 48,
            ..Default::default()
        }));
        assert!(!vxlan.satisfies(&Vxlan {
            learning: true,
            ..Default::default()
        }));
    }
}
