use std::net::IpAddr;

use anyhow::Result;
use tracing::{debug, warn};

use crate::{
    consts,
    context::Context,
    error::{is_exists, is_not_found},
    handle::SocketHandle,
    message::{InfoMessage, NeighborMessage, NetlinkRouteAttr},
    request::{NetlinkRequest, NetlinkRequestData},
    utils::{addr_to_vec, htons, ip_sat, ntohs, u16_sat, u32_sat},
};

/// A neighbor table entry. For the bridge family this is a forwarding
/// database (FDB) record.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub msg: NeighborMessage,
    pub mac: Vec<u8>,
    pub vlan: u16,
    /// Destination UDP port, host order in the model.
    pub port: u16,
    pub vni: u32,
    pub src_vni: u32,
    pub master: u32,
    pub dst: Option<IpAddr>,
    /// Derived on unmarshal: the entry points at a reachable router.
    pub router: bool,
}

impl Neighbor {
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut attrs: Vec<NetlinkRouteAttr> = Vec::new();

        if !self.mac.is_empty() {
            attrs.push(NetlinkRouteAttr::new(consts::NDA_LLADDR, self.mac.clone()));
        }

        if let Some(dst) = self.dst {
            attrs.push(NetlinkRouteAttr::new(consts::NDA_DST, addr_to_vec(dst)));
        }

        if self.vlan != 0 {
            attrs.push(NetlinkRouteAttr::new(
                consts::NDA_VLAN,
                self.vlan.to_ne_bytes().to_vec(),
            ));
        }

        if self.port != 0 {
            attrs.push(NetlinkRouteAttr::new(
                consts::NDA_PORT,
                htons(self.port).to_ne_bytes().to_vec(),
            ));
        }

        if self.vni != 0 {
            attrs.push(NetlinkRouteAttr::new(
                consts::NDA_VNI,
                self.vni.to_ne_bytes().to_vec(),
            ));
        }

        if self.src_vni != 0 {
            attrs.push(NetlinkRouteAttr::new(
                consts::NDA_SRC_VNI,
                self.src_vni.to_ne_bytes().to_vec(),
            ));
        }

        if self.master != 0 {
            attrs.push(NetlinkRouteAttr::new(
                consts::NDA_MASTER,
                self.master.to_ne_bytes().to_vec(),
            ));
        }

        let mut buf = self.msg.serialize()?;
        for attr in attrs {
            buf.extend(attr.serialize()?);
        }

        Ok(buf)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let msg = NeighborMessage::deserialize(buf)?;
        let rt_attrs = NetlinkRouteAttr::from(&buf[consts::ND_MSG_SIZE..])?;

        let mut neighbor = Neighbor {
            msg,
            router: msg.flags & consts::NTF_ROUTER != 0
                && msg.state & consts::NUD_REACHABLE != 0,
            ..Default::default()
        };

        for attr in rt_attrs {
            match attr.rta_type() {
                consts::NDA_DST => neighbor.dst = Some(attr.as_ip()?),
                consts::NDA_LLADDR => neighbor.mac = attr.value.clone(),
                consts::NDA_VLAN => neighbor.vlan = attr.as_u16()?,
                consts::NDA_PORT => neighbor.port = ntohs(attr.as_u16()?),
                consts::NDA_VNI => neighbor.vni = attr.as_u32()?,
                consts::NDA_IFINDEX => neighbor.msg.index = attr.as_u32()? as i32,
                consts::NDA_MASTER => neighbor.master = attr.as_u32()?,
                consts::NDA_SRC_VNI => neighbor.src_vni = attr.as_u32()?,
                _ => {}
            }
        }

        Ok(neighbor)
    }

    /// Conjunctive partial match against a filter template.
    pub fn satisfies(&self, spec: &Neighbor) -> bool {
        (spec.msg.family == 0 || self.msg.family == spec.msg.family)
            && (spec.msg.index == 0 || self.msg.index == spec.msg.index)
            && (spec.mac.is_empty() || self.mac == spec.mac)
            && ip_sat(self.dst, spec.dst)
            && u16_sat(self.vlan, spec.vlan)
            && u16_sat(self.port, spec.port)
            && u32_sat(self.vni, spec.vni)
            && u32_sat(self.master, spec.master)
    }

    pub fn add(&self, ctx: &Context) -> Result<()> {
        self.modify(ctx, libc::RTM_NEWNEIGH)?;
        debug!(family = self.msg.family, "neighbor added");
        Ok(())
    }

    /// Add tolerant of "already exists".
    pub fn present(&self, ctx: &Context) -> Result<()> {
        match self.add(ctx) {
            Err(e) if !is_exists(&e) => Err(e),
            _ => Ok(()),
        }
    }

    pub fn del(&self, ctx: &Context) -> Result<()> {
        self.modify(ctx, libc::RTM_DELNEIGH)
    }

    /// Del tolerant of "no such neighbor".
    pub fn absent(&self, ctx: &Context) -> Result<()> {
        match self.del(ctx) {
            Err(e) if !is_not_found(&e) => Err(e),
            _ => Ok(()),
        }
    }

    fn modify_request(&self, proto: u16) -> Result<NetlinkRequest> {
        let mut flags = libc::NLM_F_ACK;
        if proto == libc::RTM_NEWNEIGH {
            flags |= libc::NLM_F_CREATE | libc::NLM_F_EXCL;
        }

        let mut neighbor = self.clone();
        if neighbor.msg.state == 0 {
            neighbor.msg.state = consts::NUD_PERMANENT;
        }
        if neighbor.msg.family as i32 == libc::AF_UNSPEC {
            neighbor.msg.state |= consts::NUD_REACHABLE;
        }
        if neighbor.msg.family as i32 == libc::AF_BRIDGE {
            // bridge FDB entries belong to the port itself
            neighbor.msg.flags |= consts::NTF_SELF;
        }

        let mut req = NetlinkRequest::new(proto, flags);
        req.add_raw_data(neighbor.marshal()?);
        Ok(req)
    }

    fn modify(&self, ctx: &Context, proto: u16) -> Result<()> {
        let mut req = self.modify_request(proto)?;

        let mut handle = SocketHandle::dial(ctx)?;
        let _ = handle.execute(&mut req, 0)?;
        Ok(())
    }
}

/// Create a set of neighbors as one batch over one socket. The batch
/// runs in order and aborts at the first kernel failure; entries already
/// applied stay applied.
pub fn add_neighbors(ctx: &Context, neighbors: &[Neighbor]) -> Result<()> {
    modify_neighbors(ctx, neighbors, libc::RTM_NEWNEIGH)
}

/// Remove a set of neighbors as one batch over one socket.
pub fn del_neighbors(ctx: &Context, neighbors: &[Neighbor]) -> Result<()> {
    modify_neighbors(ctx, neighbors, libc::RTM_DELNEIGH)
}

fn modify_neighbors(ctx: &Context, neighbors: &[Neighbor], proto: u16) -> Result<()> {
    let mut reqs = neighbors
        .iter()
        .map(|n| n.modify_request(proto))
        .collect::<Result<Vec<_>>>()?;

    let mut handle = SocketHandle::dial(ctx)?;
    handle.update(&mut reqs)
}

/// Dump neighbors and keep the ones satisfying the spec. The bridge
/// family reads the forwarding database.
///
/// Dump shaping is a kernel constraint, not a choice: an AF_BRIDGE dump
/// wants an ifinfomsg payload where every other family wants an ndmsg
/// (https://lkml.org/lkml/2018/10/16/1407).
pub fn read_neighbors(ctx: &Context, spec: Option<&Neighbor>) -> Result<Vec<Neighbor>> {
    let default_spec = Neighbor::default();
    let spec = spec.unwrap_or(&default_spec);
    let family = spec.msg.family as i32;

    let mut req = NetlinkRequest::new(libc::RTM_GETNEIGH, libc::NLM_F_DUMP);
    if family == libc::AF_BRIDGE {
        req.add_data(Box::new(InfoMessage::new(family)));
    } else {
        req.add_data(Box::new(NeighborMessage::new(family)));
    }

    let mut handle = SocketHandle::dial(ctx)?;
    let msgs = handle.execute(&mut req, libc::RTM_NEWNEIGH)?;

    let mut neighbors = Vec::new();
    for m in &msgs {
        match Neighbor::unmarshal(m) {
            Ok(mut neighbor) => {
                // unspec replies read as plain inet entries; a bridge
                // dump reports bridge-family records
                if neighbor.msg.family as i32 == libc::AF_UNSPEC {
                    neighbor.msg.family = libc::AF_INET as u8;
                }
                if family == libc::AF_BRIDGE {
                    neighbor.msg.family = libc::AF_BRIDGE as u8;
                }

                if neighbor.satisfies(spec) {
                    neighbors.push(neighbor);
                }
            }
            Err(e) => warn!("skipping undecodable neighbor: {}", e),
        }
    }

    debug!(count = neighbors.len(), "read neighbors");
    Ok(neighbors)
}
