use std::net::IpAddr;

use anyhow::{bail, Result};
use serde::Serialize;

use crate::{
    consts,
    error::Error,
    request::NetlinkRequestData,
    utils::{align_of, vec_to_addr},
};

pub struct NetlinkMessage {
    pub header: NetlinkMessageHeader,
    pub data: Vec<u8>,
}

impl NetlinkMessage {
    pub fn from(mut buf: &[u8]) -> Result<Vec<Self>> {
        let mut msgs = Vec::new();

        while buf.len() >= consts::NLMSG_HDRLEN {
            let header = unsafe { *(buf.as_ptr() as *const NetlinkMessageHeader) };
            let msg_len = header.nlmsg_len as usize;

            if msg_len < consts::NLMSG_HDRLEN || msg_len > buf.len() {
                bail!(Error::Truncated {
                    expected: msg_len,
                    actual: buf.len(),
                });
            }

            let len = align_of(msg_len, consts::NLMSG_ALIGNTO);
            let data = buf[consts::NLMSG_HDRLEN..msg_len].to_vec();

            msgs.push(Self { header, data });
            buf = &buf[len.min(buf.len())..];
        }

        Ok(msgs)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Serialize, Debug)]
pub struct NetlinkMessageHeader {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

impl NetlinkMessageHeader {
    pub fn new(proto: u16, flags: i32) -> Self {
        Self {
            nlmsg_len: std::mem::size_of::<Self>() as u32,
            nlmsg_type: proto,
            nlmsg_flags: (libc::NLM_F_REQUEST | flags) as u16,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        }
    }
}

/// An attribute type/value pair the object model does not understand,
/// carried verbatim so a read-modify-write cycle re-emits it unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttr {
    pub rta_type: u16,
    pub value: Vec<u8>,
}

/// One TLV record of an rtnetlink attribute stream. Encoding supports
/// nested sub-sequences through `children`; records are padded to 4-byte
/// alignment on the wire.
pub struct NetlinkRouteAttr {
    pub rt_attr: RtAttr,
    pub value: Vec<u8>,
    pub children: Option<Vec<Box<dyn NetlinkRequestData>>>,
}

impl NetlinkRequestData for NetlinkRouteAttr {
    fn len(&self) -> usize {
        self.rt_attr.rta_len as usize
    }

    fn is_empty(&self) -> bool {
        self.rt_attr.rta_len == 0
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.rt_attr.rta_len.to_ne_bytes());
        buf.extend_from_slice(&self.rt_attr.rta_type.to_ne_bytes());
        buf.extend_from_slice(&self.value);

        match &self.children {
            None => {
                // the record length excludes trailing padding
                let len = buf.len() as u16;
                buf[..2].copy_from_slice(&len.to_ne_bytes());
                buf.resize(align_of(buf.len(), consts::RTA_ALIGNTO), 0);
            }
            Some(children) => {
                // children start on an aligned boundary and come out of
                // serialize already padded, so the record length covers
                // them exactly
                buf.resize(align_of(buf.len(), consts::RTA_ALIGNTO), 0);
                for child in children {
                    buf.extend_from_slice(&child.serialize()?);
                }
                let len = buf.len() as u16;
                buf[..2].copy_from_slice(&len.to_ne_bytes());
            }
        }

        Ok(buf)
    }
}

impl NetlinkRouteAttr {
    pub fn new(rta_type: u16, value: Vec<u8>) -> Self {
        Self {
            rt_attr: RtAttr {
                rta_len: (consts::RT_ATTR_SIZE + value.len()) as u16,
                rta_type,
            },
            value,
            children: None,
        }
    }

    pub fn from(mut buf: &[u8]) -> Result<Vec<Self>> {
        let mut attrs = Vec::new();

        while buf.len() >= consts::RT_ATTR_SIZE {
            let mut rt_attr = unsafe { *(buf.as_ptr() as *const RtAttr) };
            let rta_len = rt_attr.rta_len as usize;

            if rta_len < consts::RT_ATTR_SIZE || rta_len > buf.len() {
                bail!(Error::Decode(format!(
                    "attribute length {} out of range",
                    rta_len
                )));
            }

            let len = align_of(rta_len, consts::RTA_ALIGNTO);
            let value = buf[consts::RT_ATTR_SIZE..rta_len].to_vec();

            // the kernel flags some container attributes as nested; the
            // type match is on the low bits
            rt_attr.rta_type &= !consts::NLA_F_NESTED;

            attrs.push(Self {
                rt_attr,
                value,
                children: None,
            });
            buf = &buf[len.min(buf.len())..];
        }

        Ok(attrs)
    }

    pub fn add_child(&mut self, rta_type: u16, value: Vec<u8>) {
        let attr = Box::new(NetlinkRouteAttr::new(rta_type, value));
        self.rt_attr.rta_len += attr.len() as u16;

        match &mut self.children {
            None => self.children = Some(vec![attr]),
            Some(children) => children.push(attr),
        }
    }

    pub fn add_child_from_attr(&mut self, attr: Box<(impl NetlinkRequestData + 'static)>) {
        self.rt_attr.rta_len += attr.len() as u16;

        match &mut self.children {
            None => self.children = Some(vec![attr]),
            Some(children) => children.push(attr),
        }
    }

    pub fn rta_type(&self) -> u16 {
        self.rt_attr.rta_type
    }

    pub fn as_u8(&self) -> Result<u8> {
        match self.value.first() {
            Some(b) => Ok(*b),
            None => bail!(Error::Decode("empty u8 attribute".to_string())),
        }
    }

    pub fn as_u16(&self) -> Result<u16> {
        if self.value.len() < 2 {
            bail!(Error::Decode("short u16 attribute".to_string()));
        }
        Ok(u16::from_ne_bytes(self.value[..2].try_into()?))
    }

    pub fn as_u32(&self) -> Result<u32> {
        if self.value.len() < 4 {
            bail!(Error::Decode("short u32 attribute".to_string()));
        }
        Ok(u32::from_ne_bytes(self.value[..4].try_into()?))
    }

    /// The attribute payload as a string, trimmed at the first NUL.
    pub fn as_string(&self) -> Result<String> {
        let end = self
            .value
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.value.len());
        Ok(String::from_utf8(self.value[..end].to_vec())?)
    }

    pub fn as_ip(&self) -> Result<IpAddr> {
        vec_to_addr(&self.value)
    }

    /// Decode the payload as a nested attribute sequence.
    pub fn nested(&self) -> Result<Vec<NetlinkRouteAttr>> {
        Self::from(&self.value)
    }

    pub fn to_raw(&self) -> RawAttr {
        RawAttr {
            rta_type: self.rt_attr.rta_type,
            value: self.value.clone(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RtAttr {
    pub rta_len: u16,
    pub rta_type: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, Serialize, PartialEq, Eq)]
pub struct InfoMessage {
    pub family: u8,
    pub _pad: u8,
    pub ifi_type: u16,
    pub index: i32,
    pub flags: u32,
    pub change: u32,
}

impl NetlinkRequestData for InfoMessage {
    fn len(&self) -> usize {
        consts::IF_INFO_MSG_SIZE
    }

    fn is_empty(&self) -> bool {
        self.family == 0
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| e.into())
    }
}

impl InfoMessage {
    pub fn new(family: i32) -> Self {
        Self {
            family: family as u8,
            ..Default::default()
        }
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < consts::IF_INFO_MSG_SIZE {
            bail!(Error::Truncated {
                expected: consts::IF_INFO_MSG_SIZE,
                actual: buf.len(),
            });
        }
        Ok(unsafe { *(buf.as_ptr() as *const Self) })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, Serialize, PartialEq, Eq)]
pub struct AddressMessage {
    pub family: u8,
    pub prefix_len: u8,
    pub flags: u8,
    pub scope: u8,
    pub index: i32,
}

impl NetlinkRequestData for AddressMessage {
    fn len(&self) -> usize {
        consts::IF_ADDR_MSG_SIZE
    }

    fn is_empty(&self) -> bool {
        self.family == 0
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| e.into())
    }
}

impl AddressMessage {
    pub fn new(family: i32) -> Self {
        Self {
            family: family as u8,
            ..Default::default()
        }
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < consts::IF_ADDR_MSG_SIZE {
            bail!(Error::Truncated {
                expected: consts::IF_ADDR_MSG_SIZE,
                actual: buf.len(),
            });
        }
        Ok(unsafe { *(buf.as_ptr() as *const Self) })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, Serialize, PartialEq, Eq)]
pub struct RouteMessage {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub protocol: u8,
    pub scope: u8,
    pub rtm_type: u8,
    pub flags: u32,
}

impl NetlinkRequestData for RouteMessage {
    fn len(&self) -> usize {
        consts::ROUTE_MSG_SIZE
    }

    fn is_empty(&self) -> bool {
        self.family == 0
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| e.into())
    }
}

impl RouteMessage {
    pub fn new_rt_msg() -> Self {
        Self {
            table: libc::RT_TABLE_MAIN,
            protocol: libc::RTPROT_BOOT,
            scope: libc::RT_SCOPE_UNIVERSE,
            rtm_type: libc::RTN_UNICAST,
            ..Default::default()
        }
    }

    pub fn new_rt_del_msg() -> Self {
        Self {
            table: libc::RT_TABLE_MAIN,
            scope: libc::RT_SCOPE_NOWHERE,
            ..Default::default()
        }
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < consts::ROUTE_MSG_SIZE {
            bail!(Error::Truncated {
                expected: consts::ROUTE_MSG_SIZE,
                actual: buf.len(),
            });
        }
        Ok(unsafe { *(buf.as_ptr() as *const Self) })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, Serialize, PartialEq, Eq)]
pub struct RuleMessage {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub res1: u8,
    pub res2: u8,
    pub action: u8,
    pub flags: u32,
}

impl NetlinkRequestData for RuleMessage {
    fn len(&self) -> usize {
        consts::RULE_MSG_SIZE
    }

    fn is_empty(&self) -> bool {
        self.family == 0
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| e.into())
    }
}

impl RuleMessage {
    pub fn new(family: i32) -> Self {
        Self {
            family: family as u8,
            ..Default::default()
        }
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < consts::RULE_MSG_SIZE {
            bail!(Error::Truncated {
                expected: consts::RULE_MSG_SIZE,
                actual: buf.len(),
            });
        }
        Ok(unsafe { *(buf.as_ptr() as *const Self) })
    }
}

// The padding after family is part of the kernel layout, see
// include/uapi/linux/neighbour.h
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, Serialize, PartialEq, Eq)]
pub struct NeighborMessage {
    pub family: u8,
    pub _pad1: u8,
    pub _pad2: u16,
    pub index: i32,
    pub state: u16,
    pub flags: u8,
    pub ndm_type: u8,
}

impl NetlinkRequestData for NeighborMessage {
    fn len(&self) -> usize {
        consts::ND_MSG_SIZE
    }

    fn is_empty(&self) -> bool {
        self.family == 0
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| e.into())
    }
}

impl NeighborMessage {
    pub fn new(family: i32) -> Self {
        Self {
            family: family as u8,
            ..Default::default()
        }
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < consts::ND_MSG_SIZE {
            bail!(Error::Truncated {
                expected: consts::ND_MSG_SIZE,
                actual: buf.len(),
            });
        }
        Ok(unsafe { *(buf.as_ptr() as *const Self) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    static LINK_MSG: [u8; 96] = [
        0x00, // interface family
        0x00, // reserved
        0x04, 0x03, // link layer type 772 = loopback
        0x01, 0x00, 0x00, 0x00, // interface index = 1
        0x49, 0x00, 0x00, 0x00, // device flags: UP, LOOPBACK, RUNNING, LOWERUP
        0x00, 0x00, 0x00, 0x00, // reserved 2 (aka device change flag)

        // nlas
        0x07, 0x00, 0x03, 0x00, 0x6c, 0x6f, 0x00, // device name L=7,T=3,V=lo
        0x00, // padding
        0x08, 0x00, 0x0d, 0x00, 0xe8, 0x03, 0x00, 0x00, // TxQueue length L=8,T=13,V=1000
        0x05, 0x00, 0x10, 0x00, 0x00, // OperState L=5,T=16,V=0 (unknown)
        0x00, 0x00, 0x00, // padding
        0x05, 0x00, 0x11, 0x00, 0x00, // Link mode L=5,T=17,V=0
        0x00, 0x00, 0x00, // padding
        0x08, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00, // MTU L=8,T=4,V=65536
        0x08, 0x00, 0x1b, 0x00, 0x00, 0x00, 0x00, 0x00, // Group L=8,T=27,V=0
        0x08, 0x00, 0x1e, 0x00, 0x00, 0x00, 0x00, 0x00, // Promiscuity L=8,T=30,V=0
        0x08, 0x00, 0x1f, 0x00, 0x01, 0x00, 0x00, 0x00, // Number of Tx Queues L=8,T=31,V=1
        0x08, 0x00, 0x28, 0x00, 0xff, 0xff, 0x00, 0x00, // Maximum GSO segment count
        0x08, 0x00, 0x29, 0x00, 0x00, 0x00, 0x01, 0x00, // Maximum GSO size
    ];

    #[test]
    fn test_info_message() {
        let msg = InfoMessage::deserialize(&LINK_MSG).unwrap();

        assert_eq!(msg.family, 0);
        assert_eq!(msg.ifi_type, 772);
        assert_eq!(msg.index, 1);
        assert_eq!(
            msg.flags,
            libc::IFF_UP as u32 | libc::IFF_LOOPBACK as u32 | libc::IFF_RUNNING as u32
        );
        assert_eq!(msg.change, 0);
    }

    #[test]
    fn test_info_message_truncated() {
        let res = InfoMessage::deserialize(&LINK_MSG[..12]);
        assert!(res.is_err());
    }

    #[test]
    fn test_attr_stream_decode() {
        let attrs = NetlinkRouteAttr::from(&LINK_MSG[consts::IF_INFO_MSG_SIZE..]).unwrap();
        assert_eq!(attrs.len(), 10);

        assert_eq!(attrs[0].rta_type(), libc::IFLA_IFNAME);
        assert_eq!(attrs[0].as_string().unwrap(), "lo");

        assert_eq!(attrs[4].rta_type(), libc::IFLA_MTU);
        assert_eq!(attrs[4].as_u32().unwrap(), 65536);
    }

    #[test]
    fn test_attr_length_out_of_range() {
        // claims 32 bytes but only 8 are present
        let buf = [0x20, 0x00, 0x03, 0x00, 0x6c, 0x6f, 0x00, 0x00];
        assert!(NetlinkRouteAttr::from(&buf).is_err());
    }

    #[test]
    fn test_attr_serialize_leaf() {
        let name = NetlinkRouteAttr::new(libc::IFLA_IFNAME, b"lo\0".to_vec());
        let buf = name.serialize().unwrap();

        // record length excludes the trailing pad, the buffer includes it
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[..4], &[0x07, 0x00, 0x03, 0x00]);
        assert_eq!(&buf[4..7], b"lo\0");
        assert_eq!(buf[7], 0);
    }

    #[test]
    fn test_attr_serialize_nested() {
        let mut link_info = NetlinkRouteAttr::new(libc::IFLA_LINKINFO, vec![]);
        link_info.add_child(consts::IFLA_INFO_KIND, b"vrf".to_vec());

        let buf = link_info.serialize().unwrap();
        assert_eq!(buf.len(), 12);
        // parent length covers the padded child
        assert_eq!(u16::from_ne_bytes(buf[..2].try_into().unwrap()), 12);

        let parent = NetlinkRouteAttr::from(&buf).unwrap();
        assert_eq!(parent.len(), 1);
        let children = parent[0].nested().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].rta_type(), consts::IFLA_INFO_KIND);
        assert_eq!(children[0].as_string().unwrap(), "vrf");
    }

    #[test]
    fn test_nested_flag_masked() {
        let inner = NetlinkRouteAttr::new(
            consts::IFLA_BRIDGE_VLAN_INFO | consts::NLA_F_NESTED,
            vec![0x06, 0x00, 0x0a, 0x00],
        );
        let buf = inner.serialize().unwrap();

        let decoded = NetlinkRouteAttr::from(&buf).unwrap();
        assert_eq!(decoded[0].rta_type(), consts::IFLA_BRIDGE_VLAN_INFO);
    }

    #[test]
    fn test_neighbor_message_layout() {
        let msg = NeighborMessage {
            family: libc::AF_BRIDGE as u8,
            index: 4,
            state: consts::NUD_PERMANENT,
            flags: consts::NTF_SELF,
            ..Default::default()
        };

        let buf = crate::request::NetlinkRequestData::serialize(&msg).unwrap();
        assert_eq!(buf.len(), consts::ND_MSG_SIZE);
        assert_eq!(buf[0], libc::AF_BRIDGE as u8);
        assert_eq!(&buf[4..8], &4i32.to_ne_bytes());
        assert_eq!(&buf[8..10], &consts::NUD_PERMANENT.to_ne_bytes());
        assert_eq!(buf[10], consts::NTF_SELF);

        let back = NeighborMessage::deserialize(&buf).unwrap();
        assert_eq!(back.index, 4);
        assert_eq!(back.state, consts::NUD_PERMANENT);
    }

    #[test]
    fn test_rule_message_layout() {
        let msg = RuleMessage {
            family: libc::AF_INET as u8,
            dst_len: 24,
            src_len: 16,
            action: consts::FR_ACT_TO_TBL,
            ..Default::default()
        };

        let buf = crate::request::NetlinkRequestData::serialize(&msg).unwrap();
        assert_eq!(buf.len(), consts::RULE_MSG_SIZE);
        assert_eq!(buf[1], 24);
        assert_eq!(buf[2], 16);
        assert_eq!(buf[7], consts::FR_ACT_TO_TBL);

        let back = RuleMessage::deserialize(&buf).unwrap();
        assert_eq!(back.dst_len, 24);
        assert_eq!(back.action, consts::FR_ACT_TO_TBL);
    }
}
