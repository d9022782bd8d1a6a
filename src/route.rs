use std::net::IpAddr;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::{
    consts,
    context::Context,
    error::{is_exists, is_not_found},
    handle::SocketHandle,
    message::{NetlinkRouteAttr, RawAttr, RouteMessage},
    request::{NetlinkRequest, NetlinkRequestData},
    utils::{addr_to_vec, ip_sat, u32_sat},
};

/// A routing table entry: the fixed rtmsg header plus its attributes.
///
/// `table` carries the full table id; ids that fit the header byte go out
/// there, larger ones as an RTA_TABLE attribute. Attributes the model
/// does not understand ride in `raw_attrs` and are re-emitted verbatim on
/// re-encode, so a read-modify-write cycle never drops kernel state.
#[derive(Default, Debug, Clone)]
pub struct Route {
    pub msg: RouteMessage,
    pub dest: Option<IpAddr>,
    pub src: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub pref_src: Option<IpAddr>,
    pub iif: u32,
    pub oif: u32,
    pub priority: u32,
    pub metrics: u32,
    pub table: u32,
    pub raw_attrs: Vec<RawAttr>,
}

impl Route {
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut msg = self.msg;

        if self.table != 0 {
            if self.table < 256 {
                msg.table = self.table as u8;
            } else {
                msg.table = libc::RT_TABLE_UNSPEC;
            }
        }

        let mut attrs: Vec<NetlinkRouteAttr> = Vec::new();

        if let Some(dest) = self.dest {
            msg.family = Self::pick_family(msg.family, dest)?;
            attrs.push(NetlinkRouteAttr::new(libc::RTA_DST, addr_to_vec(dest)));
        }

        if let Some(src) = self.src {
            msg.family = Self::pick_family(msg.family, src)?;
            attrs.push(NetlinkRouteAttr::new(libc::RTA_SRC, addr_to_vec(src)));
        }

        if let Some(gateway) = self.gateway {
            msg.family = Self::pick_family(msg.family, gateway)?;
            attrs.push(NetlinkRouteAttr::new(
                libc::RTA_GATEWAY,
                addr_to_vec(gateway),
            ));
        }

        if let Some(pref_src) = self.pref_src {
            msg.family = Self::pick_family(msg.family, pref_src)?;
            attrs.push(NetlinkRouteAttr::new(
                libc::RTA_PREFSRC,
                addr_to_vec(pref_src),
            ));
        }

        if self.oif != 0 {
            attrs.push(NetlinkRouteAttr::new(
                libc::RTA_OIF,
                self.oif.to_ne_bytes().to_vec(),
            ));
        }

        if self.iif != 0 {
            attrs.push(NetlinkRouteAttr::new(
                libc::RTA_IIF,
                self.iif.to_ne_bytes().to_vec(),
            ));
        }

        if self.priority != 0 {
            attrs.push(NetlinkRouteAttr::new(
                libc::RTA_PRIORITY,
                self.priority.to_ne_bytes().to_vec(),
            ));
        }

        if self.metrics != 0 {
            attrs.push(NetlinkRouteAttr::new(
                libc::RTA_METRICS,
                self.metrics.to_ne_bytes().to_vec(),
            ));
        }

        if self.table >= 256 {
            attrs.push(NetlinkRouteAttr::new(
                libc::RTA_TABLE,
                self.table.to_ne_bytes().to_vec(),
            ));
        }

        for raw in &self.raw_attrs {
            attrs.push(NetlinkRouteAttr::new(raw.rta_type, raw.value.clone()));
        }

        let mut buf = msg.serialize()?;
        for attr in attrs {
            buf.extend(attr.serialize()?);
        }

        Ok(buf)
    }

    fn pick_family(current: u8, addr: IpAddr) -> Result<u8> {
        let family = match addr {
            IpAddr::V4(_) => libc::AF_INET as u8,
            IpAddr::V6(_) => libc::AF_INET6 as u8,
        };

        if current != 0 && current != family {
            bail!("route address family mismatch");
        }

        Ok(family)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let msg = RouteMessage::deserialize(buf)?;
        let rt_attrs = NetlinkRouteAttr::from(&buf[consts::ROUTE_MSG_SIZE..])?;

        let mut route = Route {
            msg,
            table: msg.table as u32,
            ..Default::default()
        };

        for attr in rt_attrs {
            match attr.rta_type() {
                libc::RTA_DST => route.dest = Some(attr.as_ip()?),
                libc::RTA_SRC => route.src = Some(attr.as_ip()?),
                libc::RTA_GATEWAY => route.gateway = Some(attr.as_ip()?),
                libc::RTA_PREFSRC => route.pref_src = Some(attr.as_ip()?),
                libc::RTA_IIF => route.iif = attr.as_u32()?,
                libc::RTA_OIF => route.oif = attr.as_u32()?,
                libc::RTA_PRIORITY => route.priority = attr.as_u32()?,
                libc::RTA_METRICS => route.metrics = attr.as_u32()?,
                libc::RTA_TABLE => route.table = attr.as_u32()?,
                _ => route.raw_attrs.push(attr.to_raw()),
            }
        }

        Ok(route)
    }

    /// Conjunctive partial match against a filter template.
    pub fn satisfies(&self, spec: &Route) -> bool {
        (spec.msg.family == 0 || self.msg.family == spec.msg.family)
            && (spec.msg.dst_len == 0 || self.msg.dst_len == spec.msg.dst_len)
            && ip_sat(self.dest, spec.dest)
            && ip_sat(self.src, spec.src)
            && ip_sat(self.gateway, spec.gateway)
            && ip_sat(self.pref_src, spec.pref_src)
            && u32_sat(self.iif, spec.iif)
            && u32_sat(self.oif, spec.oif)
            && u32_sat(self.priority, spec.priority)
            && u32_sat(self.table, spec.table)
    }

    pub fn add(&self, ctx: &Context) -> Result<()> {
        self.modify(
            ctx,
            libc::RTM_NEWROUTE,
            libc::NLM_F_CREATE | libc::NLM_F_EXCL | libc::NLM_F_ACK,
        )?;
        debug!(dest = ?self.dest, "route added");
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
        self.modify(ctx, libc::RTM_DELROUTE, libc::NLM_F_ACK)
    }

    /// Del tolerant of "no such route".
    pub fn absent(&self, ctx: &Context) -> Result<()> {
        match self.del(ctx) {
            Err(e) if !is_not_found(&e) => Err(e),
            _ => Ok(()),
        }
    }

    fn modify(&self, ctx: &Context, proto: u16, flags: i32) -> Result<()> {
        let mut req = self.modify_request(proto, flags)?;

        let mut handle = SocketHandle::dial(ctx)?;
        let _ = handle.execute(&mut req, 0)?;
        Ok(())
    }

    fn modify_request(&self, proto: u16, flags: i32) -> Result<NetlinkRequest> {
        let mut route = self.clone();

        // creates run with the usual defaults, deletes with the nowhere
        // scope the kernel expects
        if proto == libc::RTM_NEWROUTE {
            let defaults = RouteMessage::new_rt_msg();
            if route.msg.table == 0 && route.table == 0 {
                route.msg.table = defaults.table;
            }
            if route.msg.protocol == 0 {
                route.msg.protocol = defaults.protocol;
            }
            if route.msg.rtm_type == 0 {
                route.msg.rtm_type = defaults.rtm_type;
            }
            if route.msg.scope == 0 {
                route.msg.scope = defaults.scope;
            }
        } else {
            let defaults = RouteMessage::new_rt_del_msg();
            if route.msg.table == 0 && route.table == 0 {
                route.msg.table = defaults.table;
            }
            if route.msg.scope == 0 {
                route.msg.scope = defaults.scope;
            }
        }

        if let Some(IpAddr::V4(_)) = route.dest {
            if route.msg.dst_len == 0 {
                route.msg.dst_len = 32;
            }
        }
        if let Some(IpAddr::V6(_)) = route.dest {
            if route.msg.dst_len == 0 {
                route.msg.dst_len = 128;
            }
        }

        let mut req = NetlinkRequest::new(proto, flags);
        req.add_raw_data(route.marshal()?);
        Ok(req)
    }
}

/// Create a set of routes as one batch over one socket. The batch runs
/// in order and aborts at the first kernel failure; routes already
/// applied stay applied.
pub fn add_routes(ctx: &Context, routes: &[Route]) -> Result<()> {
    modify_routes(
        ctx,
        routes,
        libc::RTM_NEWROUTE,
        libc::NLM_F_CREATE | libc::NLM_F_EXCL | libc::NLM_F_ACK,
    )
}

/// Remove a set of routes as one batch over one socket.
pub fn del_routes(ctx: &Context, routes: &[Route]) -> Result<()> {
    modify_routes(ctx, routes, libc::RTM_DELROUTE, libc::NLM_F_ACK)
}

fn modify_routes(ctx: &Context, routes: &[Route], proto: u16, flags: i32) -> Result<()> {
    let mut reqs = routes
        .iter()
        .map(|r| r.modify_request(proto, flags))
        .collect::<Result<Vec<_>>>()?;

    let mut handle = SocketHandle::dial(ctx)?;
    handle.update(&mut reqs)
}

/// Dump routes and keep the ones satisfying the spec.
pub fn read_routes(ctx: &Context, spec: Option<&Route>) -> Result<Vec<Route>> {
    let default_spec = Route::default();
    let spec = spec.unwrap_or(&default_spec);

    let mut req = NetlinkRequest::new(libc::RTM_GETROUTE, libc::NLM_F_DUMP);
    req.add_data(Box::new(RouteMessage {
        family: spec.msg.family,
        ..Default::default()
    }));

    let mut handle = SocketHandle::dial(ctx)?;
    let msgs = handle.execute(&mut req, libc::RTM_NEWROUTE)?;

    let mut routes = Vec::new();
    for m in &msgs {
        match Route::unmarshal(m) {
            Ok(route) => {
                if route.satisfies(spec) {
                    routes.push(route);
                }
            }
            Err(e) => warn!("skipping undecodable route: {}", e),
        }
    }

    debug!(count = routes.len(), "read routes");
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::LinkKind;
    use crate::link::{get_link, Link};
    use crate::test_setup;
    use crate::veth::Veth;

    #[test]
    fn test_marshal_basic() {
        let route = Route {
            dest: Some("192.168.0.0".parse().unwrap()),
            gateway: Some("10.0.0.1".parse().unwrap()),
            oif: 2,
            msg: RouteMessage {
                dst_len: 24,
                ..RouteMessage::new_rt_msg()
            },
            ..Default::default()
        };

        let buf = route.marshal().unwrap();
        let msg = RouteMessage::deserialize(&buf).unwrap();
        assert_eq!(msg.family, libc::AF_INET as u8);
        assert_eq!(msg.dst_len, 24);
        assert_eq!(msg.table, libc::RT_TABLE_MAIN);

        let attrs = NetlinkRouteAttr::from(&buf[consts::ROUTE_MSG_SIZE..]).unwrap();
        let types: Vec<u16> = attrs.iter().map(|a| a.rta_type()).collect();
        assert_eq!(types, vec![libc::RTA_DST, libc::RTA_GATEWAY, libc::RTA_OIF]);
    }

    #[test]
    fn test_family_mismatch() {
        let route = Route {
            dest: Some("192.168.0.0".parse().unwrap()),
            gateway: Some("fe80::1".parse().unwrap()),
            ..Default::default()
        };

        assert!(route.marshal().is_err());
    }

    #[test]
    fn test_large_table_id_uses_attribute() {
        let route = Route {
            dest: Some("192.168.0.0".parse().unwrap()),
            table: 1042,
            msg: RouteMessage {
                dst_len: 24,
                ..Default::default()
            },
            ..Default::default()
        };

        let buf = route.marshal().unwrap();
        let msg = RouteMessage::deserialize(&buf).unwrap();
        assert_eq!(msg.table, libc::RT_TABLE_UNSPEC);

        let attrs = NetlinkRouteAttr::from(&buf[consts::ROUTE_MSG_SIZE..]).unwrap();
        let table = attrs
            .iter()
            .find(|a| a.rta_type() == libc::RTA_TABLE)
            .unwrap();
        assert_eq!(table.as_u32().unwrap(), 1042);
    }

    #[test]
    fn test_raw_attrs_round_trip() {
        let route = Route {
            dest: Some("192.168.0.0".parse().unwrap()),
            msg: RouteMessage {
                dst_len: 24,
                ..Default::default()
            },
            raw_attrs: vec![RawAttr {
                rta_type: 0x7f,
                value: vec![1, 2, 3, 4],
            }],
            ..Default::default()
        };

        // unmodeled attributes survive a re-encode cycle verbatim
        let buf = route.marshal().unwrap();
        let back = Route::unmarshal(&buf).unwrap();
        assert_eq!(back.raw_attrs, route.raw_attrs);

        let buf2 = back.marshal().unwrap();
        let back2 = Route::unmarshal(&buf2).unwrap();
        assert_eq!(back2.raw_attrs, route.raw_attrs);
    }

    #[test]
    fn test_satisfies() {
        let route = Route {
            dest: Some("192.168.0.0".parse().unwrap()),
            oif: 2,
            table: 254,
            msg: RouteMessage {
                family: libc::AF_INET as u8,
                dst_len: 24,
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(route.satisfies(&Route::default()));
        assert!(route.satisfies(&Route {
            oif: 2,
            ..Default::default()
        }));
        assert!(!route.satisfies(&Route {
            oif: 3,
            ..Default::default()
        }));
        assert!(!route.satisfies(&Route {
            dest: Some("192.168.1.0".parse().unwrap()),
            ..Default::default()
        }));
    }

    #[test]
    fn test_route_lifecycle() {
        test_setup!();
        let ctx = Context::open_default().unwrap();

        let lo = get_link(&ctx, "lo").unwrap();
        lo.up(&ctx).unwrap();

        let mut va = Link::new("vethA");
        va.info.kind = Some(LinkKind::Veth(Veth {
            peer: "vethB".to_string(),
            peer_index: 0,
        }));
        va.add(&ctx).unwrap();
        va.up(&ctx).unwrap();
        get_link(&ctx, "vethB").unwrap().up(&ctx).unwrap();

        let mut addr = crate::addr::Address::new("10.1.0.1/24".parse().unwrap());
        addr.msg.index = va.msg.index;
        addr.add(&ctx).unwrap();

        let route = Route {
            dest: Some("192.168.0.0".parse().unwrap()),
            gateway: Some("10.1.0.2".parse().unwrap()),
            oif: va.msg.index as u32,
            msg: RouteMessage {
                dst_len: 24,
                ..Default::default()
            },
            ..Default::default()
        };

        route.add(&ctx).unwrap();

        let spec = Route {
            oif: va.msg.index as u32,
            msg: RouteMessage {
                family: libc::AF_INET as u8,
                ..Default::default()
            },
            ..Default::default()
        };
        let routes = read_routes(&ctx, Some(&spec)).unwrap();
        assert!(routes
            .iter()
            .any(|r| r.dest == route.dest && r.gateway == route.gateway));

        // idempotent verbs converge; the strict ones do not
        route.present(&ctx).unwrap();
        assert!(route.add(&ctx).is_err());

        route.del(&ctx).unwrap();
        route.absent(&ctx).unwrap();
        assert!(route.del(&ctx).is_err());

        va.del(&ctx).unwrap();
    }

    #[test]
    fn test_route_batch() {
        test_setup!();
        let ctx = Context::open_default().unwrap();

        let lo = get_link(&ctx, "lo").unwrap();
        lo.up(&ctx).unwrap();

        let mut addr = crate::addr::Address::new("10.2.0.1/24".parse().unwrap());
        addr.msg.index = lo.msg.index;
        addr.add(&ctx).unwrap();

        let route = |dest: &str| Route {
            dest: Some(dest.parse().unwrap()),
            gateway: Some("10.2.0.2".parse().unwrap()),
            oif: lo.msg.index as u32,
            msg: RouteMessage {
                dst_len: 24,
                ..Default::default()
            },
            ..Default::default()
        };

        let batch = vec![route("192.168.10.0"), route("192.168.11.0")];
        add_routes(&ctx, &batch).unwrap();

        let spec = Route {
            oif: lo.msg.index as u32,
            msg: RouteMessage {
                family: libc::AF_INET as u8,
                ..Default::default()
            },
            ..Default::default()
        };
        let routes = read_routes(&ctx, Some(&spec)).unwrap();
        assert!(routes.iter().any(|r| r.dest == batch[0].dest));
        assert!(routes.iter().any(|r| r.dest == batch[1].dest));

        del_routes(&ctx, &batch).unwrap();

        let routes = read_routes(&ctx, Some(&spec)).unwrap();
        assert!(!routes.iter().any(|r| r.dest == batch[0].dest));
    }
}
