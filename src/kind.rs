use anyhow::Result;

use crate::{
    bridge::Bridge,
    consts,
    context::Context,
    macvlan::Macvlan,
    message::NetlinkRouteAttr,
    veth::Veth,
    vrf::Vrf,
    vxlan::Vxlan,
};

/// The kind-specific payload of a link. A link carries at most one of
/// these; a link with none is a physical (or otherwise default) device.
///
/// Wireguard, tap, tun and loopback are marker kinds: their wire payload
/// is the kind tag alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Veth(Veth),
    Vxlan(Vxlan),
    Bridge(Bridge),
    Vrf(Vrf),
    Macvlan(Macvlan),
    Wireguard,
    Tap,
    Tun,
    Loopback,
}

impl LinkKind {
    /// The kind tag as it appears in IFLA_INFO_KIND.
    pub fn name(&self) -> &'static str {
        match self {
            LinkKind::Veth(_) => "veth",
            LinkKind::Vxlan(_) => "vxlan",
            LinkKind::Bridge(_) => "bridge",
            LinkKind::Vrf(_) => "vrf",
            LinkKind::Macvlan(_) => "macvlan",
            LinkKind::Wireguard => "wireguard",
            LinkKind::Tap => "tap",
            LinkKind::Tun => "tun",
            LinkKind::Loopback => "loopback",
        }
    }

    /// Build the IFLA_LINKINFO attribute: kind tag plus, for kinds that
    /// have one, the nested INFO_DATA payload.
    pub(crate) fn marshal(&self) -> Result<NetlinkRouteAttr> {
        let mut link_info = NetlinkRouteAttr::new(libc::IFLA_LINKINFO, vec![]);
        link_info.add_child(consts::IFLA_INFO_KIND, self.name().as_bytes().to_vec());

        match self {
            LinkKind::Veth(v) => link_info.add_child_from_attr(Box::new(v.marshal())),
            LinkKind::Vxlan(v) => link_info.add_child_from_attr(Box::new(v.marshal())),
            LinkKind::Bridge(b) => link_info.add_child_from_attr(Box::new(b.marshal())),
            LinkKind::Vrf(v) => link_info.add_child_from_attr(Box::new(v.marshal())),
            LinkKind::Macvlan(m) => link_info.add_child_from_attr(Box::new(m.marshal())),
            LinkKind::Wireguard | LinkKind::Tap | LinkKind::Tun | LinkKind::Loopback => {}
        }

        Ok(link_info)
    }

    /// Decode the INFO_DATA payload for a kind tag. An unrecognized tag
    /// is not a decode failure: it yields `None` and the link reads as a
    /// plain device.
    pub(crate) fn unmarshal(kind: &str, data: &[u8]) -> Result<Option<Self>> {
        Ok(Some(match kind {
            "veth" => LinkKind::Veth(Veth::unmarshal(data)?),
            "vxlan" => LinkKind::Vxlan(Vxlan::unmarshal(data)?),
            "bridge" => LinkKind::Bridge(Bridge::unmarshal(data)?),
            "vrf" => LinkKind::Vrf(Vrf::unmarshal(data)?),
            "macvlan" => LinkKind::Macvlan(Macvlan::unmarshal(data)?),
            "wireguard" => LinkKind::Wireguard,
            "tap" => LinkKind::Tap,
            "tun" => LinkKind::Tun,
            "loopback" => LinkKind::Loopback,
            _ => return Ok(None),
        }))
    }

    /// The parent link index to emit as a top-level IFLA_LINK attribute,
    /// for kinds that stack on another interface.
    pub(crate) fn parent_link(&self) -> u32 {
        match self {
            LinkKind::Macvlan(m) => m.link,
            _ => 0,
        }
    }

    /// Thread the piggy-backed IFLA_LINK index into the payload it
    /// belongs to. Its meaning depends on which kind is active: a veth's
    /// peer, a macvlan's parent.
    pub(crate) fn set_piggyback_index(&mut self, index: u32) {
        match self {
            LinkKind::Veth(v) => v.peer_index = index,
            LinkKind::Macvlan(m) => m.link = index,
            _ => {}
        }
    }

    /// Run any follow-up kernel queries this kind needs before its record
    /// is complete. Only veth has such a step.
    pub fn resolve(&mut self, ctx: &Context) -> Result<()> {
        match self {
            LinkKind::Veth(v) => v.resolve(ctx),
            _ => Ok(()),
        }
    }

    /// Kind-specific partial match. Two different kinds never match; a
    /// marker kind matches its own tag.
    pub fn satisfies(&self, spec: &LinkKind) -> bool {
        match (self, spec) {
            (LinkKind::Veth(v), LinkKind::Veth(s)) => v.satisfies(s),
            (LinkKind::Vxlan(v), LinkKind::Vxlan(s)) => v.satisfies(s),
            (LinkKind::Bridge(b), LinkKind::Bridge(s)) => b.satisfies(s),
            (LinkKind::Vrf(v), LinkKind::Vrf(s)) => v.satisfies(s),
            (LinkKind::Macvlan(m), LinkKind::Macvlan(s)) => m.satisfies(s),
            (LinkKind::Wireguard, LinkKind::Wireguard)
            | (LinkKind::Tap, LinkKind::Tap)
            | (LinkKind::Tun, LinkKind::Tun)
            | (LinkKind::Loopback, LinkKind::Loopback) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::NetlinkRequestData;

    #[test]
    fn test_marker_kind_marshal_is_tag_only() {
        let buf = LinkKind::Wireguard.marshal().unwrap().serialize().unwrap();

        let link_info = NetlinkRouteAttr::from(&buf).unwrap();
        assert_eq!(link_info[0].rta_type(), libc::IFLA_LINKINFO);

        let children = link_info[0].nested().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].rta_type(), consts::IFLA_INFO_KIND);
        assert_eq!(children[0].as_string().unwrap(), "wireguard");
    }

    #[test]
    fn test_unmarshal_dispatch() {
        let kind = LinkKind::unmarshal("vrf", &[]).unwrap().unwrap();
        assert_eq!(kind.name(), "vrf");

        let kind = LinkKind::unmarshal("tun", &[]).unwrap().unwrap();
        assert_eq!(kind, LinkKind::Tun);
    }

    #[test]
    fn test_unknown_kind_is_skipped_not_fatal() {
        let kind = LinkKind::unmarshal("gre", &[1, 2, 3]).unwrap();
        assert!(kind.is_none());
    }

    #[test]
    fn test_piggyback_index_threading() {
        let mut veth = LinkKind::Veth(Veth::default());
        veth.set_piggyback_index(9);
        match &veth {
            LinkKind::Veth(v) => assert_eq!(v.peer_index, 9),
            _ => unreachable!(),
        }

        let mut macvlan = LinkKind::Macvlan(Macvlan::default());
        macvlan.set_piggyback_index(4);
        assert_eq!(macvlan.parent_link(), 4);

        let mut marker = LinkKind::Loopback;
        marker.set_piggyback_index(4);
        assert_eq!(marker.parent_link(), 0);
    }

    #[test]
    fn test_satisfies_across_kinds() {
        let bridge = LinkKind::Bridge(Bridge { vlan_aware: true });
        assert!(bridge.satisfies(&LinkKind::Bridge(Bridge::default())));
        assert!(!bridge.satisfies(&LinkKind::Vrf(Vrf::default())));
        assert!(LinkKind::Tap.satisfies(&LinkKind::Tap));
        assert!(!LinkKind::Tap.satisfies(&LinkKind::Tun));
    }
}
