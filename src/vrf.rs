use anyhow::Result;

use crate::{consts, message::NetlinkRouteAttr, utils::u32_sat};

/// A virtual routing and forwarding device bound to one routing table.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Vrf {
    pub table: u32,
}

impl Vrf {
    pub(crate) fn marshal(&self) -> NetlinkRouteAttr {
        let mut data = NetlinkRouteAttr::new(consts::IFLA_INFO_DATA, vec![]);
        data.add_child(consts::IFLA_VRF_TABLE, self.table.to_ne_bytes().to_vec());
        data
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut vrf = Vrf::default();

        for attr in NetlinkRouteAttr::from(buf)? {
            if attr.rta_type() == consts::IFLA_VRF_TABLE {
                vrf.table = attr.as_u32()?;
            }
        }

        Ok(vrf)
    }

    pub fn satisfies(&self, spec: &Vrf) -> bool {
        u32_sat(self.table, spec.table)
    }
}
