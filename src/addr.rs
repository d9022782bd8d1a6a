use std::net::IpAddr;

use anyhow::{bail, Result};
use ipnet::IpNet;
use tracing::{debug, warn};

use crate::{
    consts,
    context::Context,
    error::{is_exists, is_not_found, Error},
    handle::SocketHandle,
    message::{AddressMessage, NetlinkRouteAttr},
    request::{NetlinkRequest, NetlinkRequestData},
    utils::{addr_to_vec, ip_sat, string_sat, zero_terminated},
};

/// An interface address: the fixed ifaddrmsg header plus its attributes.
/// The prefix length lives in the header and combines with the address
/// attribute into `address`.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub msg: AddressMessage,
    pub address: Option<IpNet>,
    pub local: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    pub anycast: Option<IpAddr>,
    pub label: String,
}

impl Address {
    pub fn new(address: IpNet) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }

    /// Marshal the address into header plus attribute stream. The address
    /// attribute is always emitted; when no explicit local address is
    /// set, the address is mirrored into the local attribute, which the
    /// kernel expects for ordinary (non-peer) entries.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut msg = self.msg;

        let mut attrs: Vec<NetlinkRouteAttr> = Vec::new();

        if let Some(address) = self.address {
            if msg.family == 0 {
                msg.family = match address {
                    IpNet::V4(_) => libc::AF_INET as u8,
                    IpNet::V6(_) => libc::AF_INET6 as u8,
                };
            }
            if msg.prefix_len == 0 {
                msg.prefix_len = address.prefix_len();
            }

            attrs.push(NetlinkRouteAttr::new(
                libc::IFA_ADDRESS,
                addr_to_vec(address.addr()),
            ));

            let local = self.local.unwrap_or_else(|| address.addr());
            attrs.push(NetlinkRouteAttr::new(libc::IFA_LOCAL, addr_to_vec(local)));
        }

        if let Some(broadcast) = self.broadcast {
            attrs.push(NetlinkRouteAttr::new(
                libc::IFA_BROADCAST,
                addr_to_vec(broadcast),
            ));
        }

        if let Some(anycast) = self.anycast {
            attrs.push(NetlinkRouteAttr::new(
                libc::IFA_ANYCAST,
                addr_to_vec(anycast),
            ));
        }

        if !self.label.is_empty() {
            attrs.push(NetlinkRouteAttr::new(
                libc::IFA_LABEL,
                zero_terminated(&self.label),
            ));
        }

        let mut buf = msg.serialize()?;
        for attr in attrs {
            buf.extend(attr.serialize()?);
        }

        Ok(buf)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let msg = AddressMessage::deserialize(buf)?;
        let rt_attrs = NetlinkRouteAttr::from(&buf[consts::IF_ADDR_MSG_SIZE..])?;

        let mut addr = Address {
            msg,
            ..Default::default()
        };

        for attr in rt_attrs {
            match attr.rta_type() {
                libc::IFA_ADDRESS => {
                    addr.address = Some(IpNet::new(attr.as_ip()?, msg.prefix_len)?);
                }
                libc::IFA_LOCAL => addr.local = Some(attr.as_ip()?),
                libc::IFA_BROADCAST => addr.broadcast = Some(attr.as_ip()?),
                libc::IFA_ANYCAST => addr.anycast = Some(attr.as_ip()?),
                libc::IFA_LABEL => addr.label = attr.as_string()?,
                _ => {}
            }
        }

        Ok(addr)
    }

    /// Conjunctive partial match against a filter template.
    pub fn satisfies(&self, spec: &Address) -> bool {
        (spec.msg.index == 0 || self.msg.index == spec.msg.index)
            && (spec.msg.family == 0 || self.msg.family == spec.msg.family)
            && (spec.address.is_none() || self.address == spec.address)
            && ip_sat(self.local, spec.local)
            && string_sat(&self.label, &spec.label)
    }

    /// # Examples
    ///
    /// ```
    /// use rtlink::{addr::Address, context::Context, link};
    /// # use rtlink::test_setup;
    ///
    /// # test_setup!();
    /// let ctx = Context::open_default().unwrap();
    /// let lo = link::get_link(&ctx, "lo").unwrap();
    ///
    /// let mut addr = Address::new("127.0.0.2/32".parse().unwrap());
    /// addr.msg.index = lo.msg.index;
    /// addr.add(&ctx).unwrap();
    ///
    /// let addrs = rtlink::addr::read_addrs(&ctx, Some(&addr)).unwrap();
    /// assert_eq!(addrs.len(), 1);
    /// ```
    pub fn add(&self, ctx: &Context) -> Result<()> {
        self.modify(
            ctx,
            libc::RTM_NEWADDR,
            libc::NLM_F_CREATE | libc::NLM_F_EXCL | libc::NLM_F_ACK,
        )?;
        debug!(index = self.msg.index, "address added");
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
        self.modify(ctx, libc::RTM_DELADDR, libc::NLM_F_ACK)
    }

    /// Del tolerant of "no such address".
    pub fn absent(&self, ctx: &Context) -> Result<()> {
        match self.del(ctx) {
            Err(e) if !is_not_found(&e) => Err(e),
            _ => Ok(()),
        }
    }

    fn modify(&self, ctx: &Context, proto: u16, flags: i32) -> Result<()> {
        if self.address.is_none() {
            bail!(Error::Decode("address has no prefix".to_string()));
        }

        let mut req = NetlinkRequest::new(proto, flags);
        req.add_raw_data(self.marshal()?);

        let mut handle = SocketHandle::dial(ctx)?;
        let _ = handle.execute(&mut req, 0)?;
        Ok(())
    }
}

/// Dump addresses and keep the ones satisfying the spec. Filtering by
/// link happens through the spec's interface index.
pub fn read_addrs(ctx: &Context, spec: Option<&Address>) -> Result<Vec<Address>> {
    let default_spec = Address::default();
    let spec = spec.unwrap_or(&default_spec);

    let mut req = NetlinkRequest::new(libc::RTM_GETADDR, libc::NLM_F_DUMP);
    req.add_data(Box::new(AddressMessage::new(spec.msg.family as i32)));

    let mut handle = SocketHandle::dial(ctx)?;
    let msgs = handle.execute(&mut req, libc::RTM_NEWADDR)?;

    let mut addrs = Vec::new();
    for m in &msgs {
        match Address::unmarshal(m) {
            Ok(addr) => {
                if addr.satisfies(spec) {
                    addrs.push(addr);
                }
            }
            Err(e) => warn!("skipping undecodable address: {}", e),
        }
    }

    debug!(count = addrs.len(), "read addresses");
    Ok(addrs)
}
