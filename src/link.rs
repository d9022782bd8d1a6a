use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::{
    bridge::BridgeVlanInfo,
    consts,
    context::Context,
    error::{is_exists, is_not_found, Error},
    handle::SocketHandle,
    kind::LinkKind,
    message::{InfoMessage, NetlinkRouteAttr},
    request::{NetlinkRequest, NetlinkRequestData},
    utils::{set_sat, string_sat, u16_sat, u32_sat, zero_terminated},
};

/// A network interface: the fixed ifinfomsg header plus its modeled
/// attributes.
#[derive(Default, Debug, Clone)]
pub struct Link {
    pub msg: InfoMessage,
    pub info: LinkInfo,
}

/// The attribute side of a link. At most one kind payload is active;
/// `None` reads as a physical device.
#[derive(Default, Debug, Clone)]
pub struct LinkInfo {
    pub name: String,
    pub hw_addr: Vec<u8>,
    pub mtu: u32,
    pub promisc: u32,
    /// Namespace-move target: a namespace fd, emitted as IFLA_NET_NS_FD.
    pub ns: u32,
    /// Bridge master index.
    pub master: u32,
    /// Bridge VLAN membership. Populated only by bridge-family reads.
    pub pvid: u16,
    pub untagged: Vec<u16>,
    pub tagged: Vec<u16>,
    pub kind: Option<LinkKind>,
}

impl Link {
    pub fn new(name: &str) -> Self {
        Self {
            info: LinkInfo {
                name: name.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// The link type tag derived from the active kind payload.
    pub fn kind_name(&self) -> &str {
        match &self.info.kind {
            Some(kind) => kind.name(),
            None => "physical",
        }
    }

    /// Marshal the link into header plus attribute stream.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut buf = bincode::serialize(&self.msg)?;

        // a change message with a partial mask is flags-only; the kernel
        // would apply any attribute present, so none are sent
        if self.msg.change != 0 && self.msg.change != u32::MAX {
            return Ok(buf);
        }

        let mut attrs: Vec<NetlinkRouteAttr> = Vec::new();

        if !self.info.name.is_empty() {
            attrs.push(NetlinkRouteAttr::new(
                libc::IFLA_IFNAME,
                zero_terminated(&self.info.name),
            ));
        }

        if self.info.mtu != 0 {
            attrs.push(NetlinkRouteAttr::new(
                libc::IFLA_MTU,
                self.info.mtu.to_ne_bytes().to_vec(),
            ));
        }

        if !self.info.hw_addr.is_empty() {
            attrs.push(NetlinkRouteAttr::new(
                libc::IFLA_ADDRESS,
                self.info.hw_addr.clone(),
            ));
        }

        if self.info.master != 0 {
            attrs.push(NetlinkRouteAttr::new(
                libc::IFLA_MASTER,
                self.info.master.to_ne_bytes().to_vec(),
            ));
        }

        if self.info.ns != 0 {
            attrs.push(NetlinkRouteAttr::new(
                libc::IFLA_NET_NS_FD,
                self.info.ns.to_ne_bytes().to_vec(),
            ));
        }

        if let Some(kind) = &self.info.kind {
            let parent = kind.parent_link();
            if parent != 0 {
                attrs.push(NetlinkRouteAttr::new(
                    libc::IFLA_LINK,
                    parent.to_ne_bytes().to_vec(),
                ));
            }
            attrs.push(kind.marshal()?);
        }

        for attr in attrs {
            buf.extend(attr.serialize()?);
        }

        Ok(buf)
    }

    /// Unmarshal a link reply. A link the kernel reports without a name
    /// is a protocol anomaly and comes back as a decode error.
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let msg = InfoMessage::deserialize(buf)?;
        let rt_attrs = NetlinkRouteAttr::from(&buf[consts::IF_INFO_MSG_SIZE..])?;

        let mut info = LinkInfo::default();
        let mut kind: Option<LinkKind> = None;
        let mut piggyback_index: u32 = 0;

        for attr in rt_attrs {
            match attr.rta_type() {
                libc::IFLA_IFNAME => info.name = attr.as_string()?,
                libc::IFLA_ADDRESS => info.hw_addr = attr.value.clone(),
                libc::IFLA_MTU => info.mtu = attr.as_u32()?,
                libc::IFLA_MASTER => info.master = attr.as_u32()?,
                libc::IFLA_PROMISCUITY => info.promisc = attr.as_u32()?,
                // parent/peer index; threaded into the kind payload once
                // the kind decode has settled which kind is active
                libc::IFLA_LINK => piggyback_index = attr.as_u32()?,
                libc::IFLA_LINKINFO => kind = Self::unmarshal_link_info(&attr)?,
                libc::IFLA_AF_SPEC if msg.family as i32 == libc::AF_BRIDGE => {
                    Self::unmarshal_af_spec(&attr, &mut info)?
                }
                _ => {}
            }
        }

        if piggyback_index != 0 {
            if let Some(kind) = &mut kind {
                kind.set_piggyback_index(piggyback_index);
            }
        }

        if info.name.is_empty() {
            warn!(index = msg.index, "link has no name - this is probably a bug");
            bail!(Error::Decode(format!("link {} has no name", msg.index)));
        }

        info.kind = kind;
        Ok(Self { msg, info })
    }

    fn unmarshal_link_info(attr: &NetlinkRouteAttr) -> Result<Option<LinkKind>> {
        let mut kind_name = String::new();
        let mut data: Option<Vec<u8>> = None;

        for child in attr.nested()? {
            match child.rta_type() {
                consts::IFLA_INFO_KIND => kind_name = child.as_string()?,
                consts::IFLA_INFO_DATA => data = Some(child.value.clone()),
                _ => {}
            }
        }

        if kind_name.is_empty() {
            return Ok(None);
        }

        LinkKind::unmarshal(&kind_name, data.as_deref().unwrap_or(&[]))
    }

    fn unmarshal_af_spec(attr: &NetlinkRouteAttr, info: &mut LinkInfo) -> Result<()> {
        for child in attr.nested()? {
            if child.rta_type() != consts::IFLA_BRIDGE_VLAN_INFO {
                continue;
            }

            let entry = BridgeVlanInfo::deserialize(&child.value)?;
            if entry.is_pvid() {
                info.pvid = entry.vid;
            }
            if entry.is_untagged() {
                info.untagged.push(entry.vid);
            } else {
                info.tagged.push(entry.vid);
            }
        }

        Ok(())
    }

    /// Conjunctive partial match against a filter template. Unset spec
    /// fields are wildcards; the membership sets match on intersection;
    /// kind matching is delegated to the active kind.
    pub fn satisfies(&self, spec: &Link) -> bool {
        (spec.msg.index == 0 || self.msg.index == spec.msg.index)
            && string_sat(&self.info.name, &spec.info.name)
            && u32_sat(self.info.mtu, spec.info.mtu)
            && u32_sat(self.info.master, spec.info.master)
            && u16_sat(self.info.pvid, spec.info.pvid)
            && set_sat(&self.info.untagged, &spec.info.untagged)
            && set_sat(&self.info.tagged, &spec.info.tagged)
            && match &spec.info.kind {
                None => true,
                Some(k) => match &self.info.kind {
                    Some(mine) => mine.satisfies(k),
                    None => false,
                },
            }
    }

    /// Run the active kind's follow-up queries (veth peer name).
    pub fn resolve(&mut self, ctx: &Context) -> Result<()> {
        match &mut self.info.kind {
            Some(kind) => kind.resolve(ctx),
            None => Ok(()),
        }
    }

    /// Create the link, then re-read it so kernel-assigned fields
    /// (the index) become authoritative.
    ///
    /// # Examples
    ///
    /// ```
    /// use rtlink::{context::Context, kind::LinkKind, link::Link, veth::Veth};
    /// # use rtlink::test_setup;
    ///
    /// # test_setup!();
    /// let ctx = Context::open_default().unwrap();
    ///
    /// let mut va = Link::new("vethA");
    /// va.info.kind = Some(LinkKind::Veth(Veth {
    ///     peer: "vethB".to_string(),
    ///     peer_index: 0,
    /// }));
    ///
    /// va.add(&ctx).unwrap();
    /// assert_ne!(va.msg.index, 0);
    /// ```
    pub fn add(&mut self, ctx: &Context) -> Result<()> {
        self.modify(
            ctx,
            libc::RTM_NEWLINK,
            libc::NLM_F_CREATE | libc::NLM_F_EXCL | libc::NLM_F_ACK,
        )?;
        debug!(name = %self.info.name, "link added");

        let fresh = get_link(ctx, &self.info.name)?;
        self.msg = fresh.msg;
        Ok(())
    }

    /// Add tolerant of "already exists". Converges to success on repeat
    /// invocation against unchanged desired state.
    pub fn present(&mut self, ctx: &Context) -> Result<()> {
        match self.modify(
            ctx,
            libc::RTM_NEWLINK,
            libc::NLM_F_CREATE | libc::NLM_F_EXCL | libc::NLM_F_ACK,
        ) {
            Ok(()) => {}
            Err(e) if is_exists(&e) => {
                debug!(name = %self.info.name, "link already present");
            }
            Err(e) => return Err(e),
        }

        let fresh = get_link(ctx, &self.info.name)?;
        self.msg = fresh.msg;
        Ok(())
    }

    /// Delete by index when known, by name otherwise. The kernel resolves
    /// the name itself, so a missing device surfaces as its own error.
    pub fn del(&self, ctx: &Context) -> Result<()> {
        let mut spec = Link::default();
        spec.msg.index = self.msg.index;
        if self.msg.index == 0 {
            spec.info.name = self.info.name.clone();
        }

        spec.modify(ctx, libc::RTM_DELLINK, libc::NLM_F_ACK)
    }

    /// Del tolerant of "no such device".
    pub fn absent(&self, ctx: &Context) -> Result<()> {
        match self.del(ctx) {
            Err(e) if !is_not_found(&e) => Err(e),
            _ => Ok(()),
        }
    }

    /// Modify the link in place from its populated fields.
    pub fn set(&self, ctx: &Context) -> Result<()> {
        self.modify(ctx, libc::RTM_SETLINK, libc::NLM_F_ACK)
    }

    /// Refresh this link from the kernel.
    ///
    /// With `msg.family == AF_BRIDGE` only the VLAN membership fields
    /// (pvid, untagged, tagged) are refreshed and every other field is
    /// left untouched; the bridge-family dump reports port membership,
    /// not the full attribute set. Any other family replaces the whole
    /// record with kernel-authoritative values.
    pub fn read(&mut self, ctx: &Context) -> Result<()> {
        let mut spec = Link::default();
        spec.msg.family = self.msg.family;
        spec.msg.index = self.msg.index;
        if self.msg.index == 0 {
            spec.info.name = self.info.name.clone();
        }

        let ident = if self.info.name.is_empty() {
            format!("link index {}", self.msg.index)
        } else {
            self.info.name.clone()
        };

        let mut links = read_links(ctx, Some(&spec))?;
        let fresh = match links.len() {
            0 => bail!(Error::NotFound(ident)),
            1 => links.remove(0),
            _ => bail!(Error::NotUnique(ident)),
        };

        if self.msg.family as i32 == libc::AF_BRIDGE {
            self.info.pvid = fresh.info.pvid;
            self.info.untagged = fresh.info.untagged;
            self.info.tagged = fresh.info.tagged;
        } else {
            *self = fresh;
        }

        Ok(())
    }

    /// Bring the link up. Reads current state first and no-ops when the
    /// flag already holds, so unrelated flags sharing the change mask are
    /// never clobbered.
    pub fn up(&self, ctx: &Context) -> Result<()> {
        self.set_flags(ctx, libc::IFF_UP as u32, true)
    }

    /// Take the link down.
    pub fn down(&self, ctx: &Context) -> Result<()> {
        self.set_flags(ctx, libc::IFF_UP as u32, false)
    }

    /// Switch promiscuous mode.
    pub fn set_promisc(&self, ctx: &Context, on: bool) -> Result<()> {
        self.set_flags(ctx, libc::IFF_PROMISC as u32, on)
    }

    fn set_flags(&self, ctx: &Context, mask: u32, on: bool) -> Result<()> {
        let index = self.ensure_index(ctx)?;
        let current = get_link_by_index(ctx, index)?;

        if (current.msg.flags & mask != 0) == on {
            return Ok(());
        }

        let mut change = Link::default();
        change.msg.index = index;
        change.msg.flags = if on {
            current.msg.flags | mask
        } else {
            current.msg.flags & !mask
        };
        change.msg.change = mask;

        change.modify(ctx, libc::RTM_SETLINK, libc::NLM_F_ACK)
    }

    /// Set the MTU, as a no-op when the kernel already reports the target
    /// value.
    pub fn set_mtu(&self, ctx: &Context, mtu: u32) -> Result<()> {
        let index = self.ensure_index(ctx)?;
        let current = get_link_by_index(ctx, index)?;

        if current.info.mtu == mtu {
            return Ok(());
        }

        let mut change = Link::default();
        change.msg.index = index;
        change.info.mtu = mtu;

        change.modify(ctx, libc::RTM_SETLINK, libc::NLM_F_ACK)
    }

    /// Attach the link to a master device, or detach with master 0.
    pub fn set_master(&self, ctx: &Context, master: u32) -> Result<()> {
        let index = self.ensure_index(ctx)?;
        let current = get_link_by_index(ctx, index)?;

        if current.info.master == master {
            return Ok(());
        }

        // zero detaches, so the attribute is emitted unconditionally here
        let mut req = NetlinkRequest::new(libc::RTM_SETLINK, libc::NLM_F_ACK);
        let mut msg = InfoMessage::default();
        msg.index = index;
        req.add_data(Box::new(msg));
        req.add_data(Box::new(NetlinkRouteAttr::new(
            libc::IFLA_MASTER,
            master.to_ne_bytes().to_vec(),
        )));

        let mut handle = SocketHandle::dial(ctx)?;
        let _ = handle.execute(&mut req, 0)?;
        Ok(())
    }

    /// Make the port's untagged VLAN `vid` (also its pvid). A membership
    /// that already holds is a silent no-op.
    pub fn set_untagged(&self, ctx: &Context, vid: u16) -> Result<()> {
        let index = self.ensure_index(ctx)?;
        let (pvid, untagged, _) = vlan_membership(ctx, index)?;

        if pvid == vid && untagged.contains(&vid) {
            return Ok(());
        }

        vlan_modify(
            ctx,
            index,
            vid,
            consts::BRIDGE_VLAN_INFO_PVID | consts::BRIDGE_VLAN_INFO_UNTAGGED,
            libc::RTM_SETLINK,
        )
    }

    /// Remove untagged VLAN `vid` from the port. Removing an absent
    /// membership is a silent no-op.
    pub fn unset_untagged(&self, ctx: &Context, vid: u16) -> Result<()> {
        let index = self.ensure_index(ctx)?;
        let (_, untagged, _) = vlan_membership(ctx, index)?;

        if !untagged.contains(&vid) {
            return Ok(());
        }

        vlan_modify(
            ctx,
            index,
            vid,
            consts::BRIDGE_VLAN_INFO_PVID | consts::BRIDGE_VLAN_INFO_UNTAGGED,
            libc::RTM_DELLINK,
        )
    }

    /// Add tagged VLAN `vid` to the port, or no-op when present.
    pub fn set_tagged(&self, ctx: &Context, vid: u16) -> Result<()> {
        let index = self.ensure_index(ctx)?;
        let (_, _, tagged) = vlan_membership(ctx, index)?;

        if tagged.contains(&vid) {
            return Ok(());
        }

        vlan_modify(ctx, index, vid, 0, libc::RTM_SETLINK)
    }

    /// Remove tagged VLAN `vid` from the port, or no-op when absent.
    pub fn unset_tagged(&self, ctx: &Context, vid: u16) -> Result<()> {
        let index = self.ensure_index(ctx)?;
        let (_, _, tagged) = vlan_membership(ctx, index)?;

        if !tagged.contains(&vid) {
            return Ok(());
        }

        vlan_modify(ctx, index, vid, 0, libc::RTM_DELLINK)
    }

    /// Reconcile the port's whole VLAN membership against the desired
    /// state in `info`: missing memberships are added, undesired ones
    /// removed, everything already in place is left alone.
    pub fn set_vlan(&self, ctx: &Context) -> Result<()> {
        let index = self.ensure_index(ctx)?;
        let (_, untagged, tagged) = vlan_membership(ctx, index)?;

        for vid in &self.info.untagged {
            if untagged.contains(vid) {
                continue;
            }
            let mut flags = consts::BRIDGE_VLAN_INFO_UNTAGGED;
            if *vid == self.info.pvid {
                flags |= consts::BRIDGE_VLAN_INFO_PVID;
            }
            vlan_modify(ctx, index, *vid, flags, libc::RTM_SETLINK)?;
        }

        for vid in &self.info.tagged {
            if tagged.contains(vid) {
                continue;
            }
            vlan_modify(ctx, index, *vid, 0, libc::RTM_SETLINK)?;
        }

        for vid in &untagged {
            if self.info.untagged.contains(vid) {
                continue;
            }
            vlan_modify(
                ctx,
                index,
                *vid,
                consts::BRIDGE_VLAN_INFO_UNTAGGED,
                libc::RTM_DELLINK,
            )?;
        }

        for vid in &tagged {
            if self.info.tagged.contains(vid) {
                continue;
            }
            vlan_modify(ctx, index, *vid, 0, libc::RTM_DELLINK)?;
        }

        Ok(())
    }

    fn modify(&self, ctx: &Context, proto: u16, flags: i32) -> Result<()> {
        let mut req = NetlinkRequest::new(proto, flags);
        req.add_raw_data(self.marshal()?);

        let mut handle = SocketHandle::dial(ctx)?;
        let _ = handle.execute(&mut req, 0)?;
        Ok(())
    }

    fn ensure_index(&self, ctx: &Context) -> Result<i32> {
        match self.msg.index {
            0 => Ok(get_link(ctx, &self.info.name)?.msg.index),
            n => Ok(n),
        }
    }
}

/// Dump links and keep the ones satisfying the spec. A spec naming one
/// specific index uses the kernel's atomic single-item retrieval; "all"
/// and every bridge-family query use dump mode, which is the only path
/// exposing the extended VLAN attributes.
pub fn read_links(ctx: &Context, spec: Option<&Link>) -> Result<Vec<Link>> {
    let default_spec = Link::default();
    let spec = spec.unwrap_or(&default_spec);

    let bridge = spec.msg.family as i32 == libc::AF_BRIDGE;
    let flags = if spec.msg.index != 0 && !bridge {
        0
    } else {
        libc::NLM_F_DUMP
    };

    let mut req = NetlinkRequest::new(libc::RTM_GETLINK, flags);
    let mut data = spec.marshal()?;
    if bridge {
        // without the extended mask the kernel omits the VLAN attributes
        data.extend(
            NetlinkRouteAttr::new(
                libc::IFLA_EXT_MASK,
                consts::RTEXT_FILTER_BRVLAN.to_ne_bytes().to_vec(),
            )
            .serialize()?,
        );
    }
    req.add_raw_data(data);

    let mut handle = SocketHandle::dial(ctx)?;
    let msgs = handle.execute(&mut req, libc::RTM_NEWLINK)?;

    let mut links = Vec::new();
    for m in &msgs {
        match Link::unmarshal(m) {
            Ok(link) => {
                if link.satisfies(spec) {
                    links.push(link);
                }
            }
            Err(e) => warn!("skipping undecodable link: {}", e),
        }
    }

    debug!(count = links.len(), "read links");
    Ok(links)
}

/// Look a link up by name. Zero matches and several matches are reported
/// distinctly, so callers can tell nonexistence from ambiguity.
///
/// # Examples
///
/// ```
/// use rtlink::{context::Context, link};
/// # use rtlink::test_setup;
///
/// # test_setup!();
/// let ctx = Context::open_default().unwrap();
///
/// let lo = link::get_link(&ctx, "lo").unwrap();
/// assert_eq!(lo.msg.index, 1);
/// assert_eq!(lo.info.name, "lo");
/// ```
pub fn get_link(ctx: &Context, name: &str) -> Result<Link> {
    let mut spec = Link::default();
    spec.info.name = name.to_string();

    let mut links = read_links(ctx, Some(&spec))?;
    match links.len() {
        0 => bail!(Error::NotFound(name.to_string())),
        1 => Ok(links.remove(0)),
        _ => bail!(Error::NotUnique(name.to_string())),
    }
}

/// Look a link up by kernel index.
pub fn get_link_by_index(ctx: &Context, index: i32) -> Result<Link> {
    let mut spec = Link::default();
    spec.msg.index = index;

    // atomic retrieval reports a missing index as a kernel error rather
    // than an empty dump
    let mut links = match read_links(ctx, Some(&spec)) {
        Ok(links) => links,
        Err(e) if is_not_found(&e) => Vec::new(),
        Err(e) => return Err(e),
    };

    match links.len() {
        0 => bail!(Error::NotFound(format!("link index {}", index))),
        1 => Ok(links.remove(0)),
        _ => bail!(Error::NotUnique(format!("link index {}", index))),
    }
}

/// Current VLAN membership of a port: (pvid, untagged, tagged). A link
/// the bridge-family dump does not report has no membership.
fn vlan_membership(ctx: &Context, index: i32) -> Result<(u16, Vec<u16>, Vec<u16>)> {
    let mut spec = Link::default();
    spec.msg.family = libc::AF_BRIDGE as u8;
    spec.msg.index = index;

    let mut links = read_links(ctx, Some(&spec))?;
    match links.len() {
        0 => Ok((0, Vec::new(), Vec::new())),
        _ => {
            let link = links.remove(0);
            Ok((link.info.pvid, link.info.untagged, link.info.tagged))
        }
    }
}

fn vlan_modify(ctx: &Context, index: i32, vid: u16, flags: u16, proto: u16) -> Result<()> {
    let mut req = NetlinkRequest::new(proto, libc::NLM_F_ACK);

    let mut msg = InfoMessage::new(libc::AF_BRIDGE);
    msg.index = index;
    req.add_data(Box::new(msg));

    let mut af_spec = NetlinkRouteAttr::new(libc::IFLA_AF_SPEC, vec![]);
    af_spec.add_child(
        consts::IFLA_BRIDGE_VLAN_INFO,
        BridgeVlanInfo::new(vid, flags).serialize()?,
    );
    req.add_data(Box::new(af_spec));

    let mut handle = SocketHandle::dial(ctx)?;
    let _ = handle.execute(&mut req, 0)?;

    debug!(index, vid, proto, "bridge vlan membership updated");
    Ok(())
}
