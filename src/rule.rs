use std::net::IpAddr;

use anyhow::Result;
use tracing::{debug, warn};

use crate::{
    consts,
    context::Context,
    error::{is_exists, is_not_found},
    handle::SocketHandle,
    message::{NetlinkRouteAttr, RawAttr, RuleMessage},
    request::{NetlinkRequest, NetlinkRequestData},
    utils::{addr_to_vec, ip_sat, string_sat, u32_sat, zero_terminated},
};

/// A policy routing rule: the fixed fib_rule_hdr plus its attributes.
///
/// The source and destination prefix lengths live in the header and each
/// derives from its own prefix; `table` carries the full table id, with
/// ids past the header byte going out as an FRA_TABLE attribute. Unknown
/// attributes ride in `raw_attrs` and are re-emitted on re-encode.
#[derive(Default, Debug, Clone)]
pub struct Rule {
    pub msg: RuleMessage,
    pub priority: u32,
    pub src: Option<IpAddr>,
    pub dest: Option<IpAddr>,
    pub iif: String,
    pub oif: String,
    pub fwmark: u32,
    pub table: u32,
    pub raw_attrs: Vec<RawAttr>,
}

impl Rule {
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut msg = self.msg;

        if msg.action == 0 {
            msg.action = consts::FR_ACT_TO_TBL;
        }

        if self.table < 256 {
            msg.table = self.table as u8;
        }

        let mut attrs: Vec<NetlinkRouteAttr> = Vec::new();

        if self.priority != 0 {
            attrs.push(NetlinkRouteAttr::new(
                consts::FRA_PRIORITY,
                self.priority.to_ne_bytes().to_vec(),
            ));
        }

        if let Some(src) = self.src {
            attrs.push(NetlinkRouteAttr::new(consts::FRA_SRC, addr_to_vec(src)));
        }

        if let Some(dest) = self.dest {
            attrs.push(NetlinkRouteAttr::new(consts::FRA_DST, addr_to_vec(dest)));
        }

        if !self.oif.is_empty() {
            attrs.push(NetlinkRouteAttr::new(
                consts::FRA_OIFNAME,
                zero_terminated(&self.oif),
            ));
        }

        if !self.iif.is_empty() {
            attrs.push(NetlinkRouteAttr::new(
                consts::FRA_IIFNAME,
                zero_terminated(&self.iif),
            ));
        }

        if self.fwmark != 0 {
            attrs.push(NetlinkRouteAttr::new(
                consts::FRA_FWMARK,
                self.fwmark.to_ne_bytes().to_vec(),
            ));
        }

        if self.table >= 256 {
            attrs.push(NetlinkRouteAttr::new(
                consts::FRA_TABLE,
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

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let msg = RuleMessage::deserialize(buf)?;
        let rt_attrs = NetlinkRouteAttr::from(&buf[consts::RULE_MSG_SIZE..])?;

        let mut rule = Rule {
            msg,
            table: msg.table as u32,
            ..Default::default()
        };

        for attr in rt_attrs {
            match attr.rta_type() {
                consts::FRA_PRIORITY => rule.priority = attr.as_u32()?,
                consts::FRA_SRC => rule.src = Some(attr.as_ip()?),
                consts::FRA_DST => rule.dest = Some(attr.as_ip()?),
                consts::FRA_OIFNAME => rule.oif = attr.as_string()?,
                consts::FRA_IIFNAME => rule.iif = attr.as_string()?,
                consts::FRA_FWMARK => rule.fwmark = attr.as_u32()?,
                consts::FRA_TABLE => rule.table = attr.as_u32()?,
                _ => rule.raw_attrs.push(attr.to_raw()),
            }
        }

        Ok(rule)
    }

    /// Conjunctive partial match against a filter template.
    pub fn satisfies(&self, spec: &Rule) -> bool {
        (spec.msg.family == 0 || self.msg.family == spec.msg.family)
            && u32_sat(self.priority, spec.priority)
            && u32_sat(self.table, spec.table)
            && u32_sat(self.fwmark, spec.fwmark)
            && ip_sat(self.src, spec.src)
            && ip_sat(self.dest, spec.dest)
            && string_sat(&self.iif, &spec.iif)
            && string_sat(&self.oif, &spec.oif)
    }

    pub fn add(&self, ctx: &Context) -> Result<()> {
        self.modify(ctx, libc::RTM_NEWRULE)?;
        debug!(priority = self.priority, table = self.table, "rule added");
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
        self.modify(ctx, libc::RTM_DELRULE)
    }

    /// Del tolerant of "no such rule".
    pub fn absent(&self, ctx: &Context) -> Result<()> {
        match self.del(ctx) {
            Err(e) if !is_not_found(&e) => Err(e),
            _ => Ok(()),
        }
    }

    fn modify(&self, ctx: &Context, proto: u16) -> Result<()> {
        let mut flags = libc::NLM_F_ACK | libc::NLM_F_EXCL;
        if proto == libc::RTM_NEWRULE {
            flags |= libc::NLM_F_CREATE;
        }

        let mut req = NetlinkRequest::new(proto, flags);
        req.add_raw_data(self.marshal()?);

        let mut handle = SocketHandle::dial(ctx)?;
        let _ = handle.execute(&mut req, 0)?;
        Ok(())
    }
}

/// Dump rules and keep the ones satisfying the spec.
pub fn read_rules(ctx: &Context, spec: Option<&Rule>) -> Result<Vec<Rule>> {
    let default_spec = Rule::default();
    let spec = spec.unwrap_or(&default_spec);

    let mut req = NetlinkRequest::new(libc::RTM_GETRULE, libc::NLM_F_DUMP);
    req.add_data(Box::new(RuleMessage::new(spec.msg.family as i32)));

    let mut handle = SocketHandle::dial(ctx)?;
    let msgs = handle.execute(&mut req, libc::RTM_NEWRULE)?;

    let mut rules = Vec::new();
    for m in &msgs {
        match Rule::unmarshal(m) {
            Ok(rule) => {
                if rule.satisfies(spec) {
                    rules.push(rule);
                }
            }
            Err(e) => warn!("skipping undecodable rule: {}", e),
        }
    }

    debug!(count = rules.len(), "read rules");
    Ok(rules)
}
