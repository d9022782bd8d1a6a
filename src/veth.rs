use anyhow::Result;

use crate::{
    consts,
    context::Context,
    link::get_link_by_index,
    message::NetlinkRouteAttr,
    utils::{string_sat, zero_terminated},
};

/// A virtual ethernet pair endpoint.
///
/// The wire protocol only ever carries the peer's interface index on
/// reads; the usable peer name stays empty until [`Veth::resolve`] runs a
/// secondary lookup against that index.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Veth {
    pub peer: String,
    pub peer_index: u32,
}

impl Veth {
    pub(crate) fn marshal(&self) -> NetlinkRouteAttr {
        let mut data = NetlinkRouteAttr::new(consts::IFLA_INFO_DATA, vec![]);

        // VETH_INFO_PEER leads with space for an ifinfomsg describing the
        // peer interface, then the peer's own attribute stream
        let mut peer = NetlinkRouteAttr::new(
            consts::VETH_INFO_PEER,
            vec![0u8; consts::IF_INFO_MSG_SIZE],
        );
        peer.add_child(libc::IFLA_IFNAME, zero_terminated(&self.peer));

        data.add_child_from_attr(Box::new(peer));
        data
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut veth = Veth::default();

        for attr in NetlinkRouteAttr::from(buf)? {
            if attr.rta_type() != consts::VETH_INFO_PEER {
                continue;
            }
            if attr.value.len() <= consts::IF_INFO_MSG_SIZE {
                continue;
            }
            for child in NetlinkRouteAttr::from(&attr.value[consts::IF_INFO_MSG_SIZE..])? {
                if child.rta_type() == libc::IFLA_IFNAME {
                    veth.peer = child.as_string()?;
                }
            }
        }

        Ok(veth)
    }

    /// Fill in the peer interface name from its index with a second
    /// kernel round trip. A record fresh off the wire is not complete
    /// until this has run.
    pub fn resolve(&mut self, ctx: &Context) -> Result<()> {
        if self.peer_index == 0 {
            return Ok(());
        }

        let peer = get_link_by_index(ctx, self.peer_index as i32)?;
        self.peer = peer.info.name;

        Ok(())
    }

    pub fn satisfies(&self, spec: &Veth) -> bool {
        string_sat(&self.peer, &spec.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::NetlinkRequestData;

    #[test]
    fn test_marshal_layout() {
        let veth = Veth {
            peer: "vethB".to_string(),
            peer_index: 0,
        };

        let buf = veth.marshal().serialize().unwrap();

        // INFO_DATA > VETH_INFO_PEER > [ifinfomsg pad] IFLA_IFNAME
        let data = NetlinkRouteAttr::from(&buf).unwrap();
        assert_eq!(data[0].rta_type(), consts::IFLA_INFO_DATA);

        let peers = data[0].nested().unwrap();
        assert_eq!(peers[0].rta_type(), consts::VETH_INFO_PEER);
        assert_eq!(&peers[0].value[..consts::IF_INFO_MSG_SIZE], &[0u8; 16]);

        let names =
            NetlinkRouteAttr::from(&peers[0].value[consts::IF_INFO_MSG_SIZE..]).unwrap();
        assert_eq!(names[0].rta_type(), libc::IFLA_IFNAME);
        assert_eq!(names[0].as_string().unwrap(), "vethB");
    }

    #[test]
    fn test_unmarshal_peer_name_stays_unresolved() {
        // the kernel reports a veth without VETH_INFO_PEER; the peer name
        // is the zero value until resolve runs
        let veth = Veth::unmarshal(&[]).unwrap();
        assert_eq!(veth.peer, "");
        assert_eq!(veth.peer_index, 0);
    }

    #[test]
    fn test_marshal_unmarshal_round_trip() {
        let veth = Veth {
            peer: "vethB".to_string(),
            peer_index: 0,
        };

        let buf = veth.marshal().serialize().unwrap();
        let data = NetlinkRouteAttr::from(&buf).unwrap();
        let back = Veth::unmarshal(&data[0].value).unwrap();

        assert_eq!(back.peer, "vethB");
    }

    #[test]
    fn test_satisfies() {
        let veth = Veth {
            peer: "vethB".to_string(),
            peer_index: 7,
        };

        assert!(veth.satisfies(&Veth::default()));
        assert!(veth.satisfies(&Veth {
            peer: "vethB".to_string(),
            ..Default::default()
        }));
        assert!(!veth.satisfies(&Veth {
            peer: "vethC".to_string(),
            ..Default::default()
        }));
    }
}
