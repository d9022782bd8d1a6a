pub const NLMSG_ALIGNTO: usize = 0x4;
pub const RTA_ALIGNTO: usize = 0x4;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_HDRLEN: usize = 0x10;

pub const NLA_F_NESTED: u16 = 0x8000;

pub const RECV_BUF_SIZE: usize = 65536;
pub const PID_KERNEL: u32 = 0;

pub const RT_ATTR_SIZE: usize = 0x4;
pub const IF_INFO_MSG_SIZE: usize = 0x10;
pub const IF_ADDR_MSG_SIZE: usize = 0x8;
pub const ROUTE_MSG_SIZE: usize = 0xC;
pub const RULE_MSG_SIZE: usize = 0xC;
pub const ND_MSG_SIZE: usize = 0xC;

// IFLA_LINKINFO nesting
pub const IFLA_INFO_KIND: u16 = 0x1;
pub const IFLA_INFO_DATA: u16 = 0x2;

pub const VETH_INFO_PEER: u16 = 0x1;

pub const IFLA_VXLAN_ID: u16 = 0x1;
pub const IFLA_VXLAN_LINK: u16 = 0x3;
pub const IFLA_VXLAN_LOCAL: u16 = 0x4;
pub const IFLA_VXLAN_LEARNING: u16 = 0x7;
pub const IFLA_VXLAN_PORT: u16 = 0xF;
pub const IFLA_VXLAN_LOCAL6: u16 = 0x11;

pub const IFLA_BR_VLAN_FILTERING: u16 = 0x7;

pub const IFLA_VRF_TABLE: u16 = 0x1;

pub const IFLA_MACVLAN_MODE: u16 = 0x1;

// IFLA_AF_SPEC nesting for the bridge family
pub const IFLA_BRIDGE_FLAGS: u16 = 0x0;
pub const IFLA_BRIDGE_VLAN_INFO: u16 = 0x2;

pub const BRIDGE_VLAN_INFO_MASTER: u16 = 0x1;
pub const BRIDGE_VLAN_INFO_PVID: u16 = 0x2;
pub const BRIDGE_VLAN_INFO_UNTAGGED: u16 = 0x4;
pub const BRIDGE_VLAN_INFO_RANGE_BEGIN: u16 = 0x8;
pub const BRIDGE_VLAN_INFO_RANGE_END: u16 = 0x10;

// RTM_GETLINK extended attribute filtering
pub const RTEXT_FILTER_BRVLAN: u32 = 0x2;

// fib rule attribute types
pub const FRA_DST: u16 = 0x1;
pub const FRA_SRC: u16 = 0x2;
pub const FRA_IIFNAME: u16 = 0x3;
pub const FRA_PRIORITY: u16 = 0x6;
pub const FRA_FWMARK: u16 = 0xA;
pub const FRA_TABLE: u16 = 0xF;
pub const FRA_OIFNAME: u16 = 0x11;

// fib rule actions
pub const FR_ACT_TO_TBL: u8 = 0x1;

// neighbor attribute types
pub const NDA_DST: u16 = 0x1;
pub const NDA_LLADDR: u16 = 0x2;
pub const NDA_VLAN: u16 = 0x5;
pub const NDA_PORT: u16 = 0x6;
pub const NDA_VNI: u16 = 0x7;
pub const NDA_IFINDEX: u16 = 0x8;
pub const NDA_MASTER: u16 = 0x9;
pub const NDA_SRC_VNI: u16 = 0xB;

// neighbor cache entry flags
pub const NTF_SELF: u8 = 0x2;
pub const NTF_ROUTER: u8 = 0x80;

// neighbor cache entry states
pub const NUD_REACHABLE: u16 = 0x2;
pub const NUD_PERMANENT: u16 = 0x80;
