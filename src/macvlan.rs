use anyhow::{bail, Result};

use crate::{consts, message::NetlinkRouteAttr, utils::u32_sat};

/// Macvlan operating modes, bit-flag valued per the kernel ABI.
#[repr(u32)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacvlanMode {
    #[default]
    Unspec = 0,
    Private = 1,
    Vepa = 2,
    Bridge = 4,
    Passthru = 8,
    Source = 16,
}

impl MacvlanMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Private,
            2 => Self::Vepa,
            4 => Self::Bridge,
            8 => Self::Passthru,
            16 => Self::Source,
            _ => Self::Unspec,
        }
    }
}

pub fn parse_macvlan_mode(mode: &str) -> Result<MacvlanMode> {
    match mode {
        "private" => Ok(MacvlanMode::Private),
        "vepa" => Ok(MacvlanMode::Vepa),
        "bridge" => Ok(MacvlanMode::Bridge),
        "passthru" => Ok(MacvlanMode::Passthru),
        "source" => Ok(MacvlanMode::Source),
        _ => bail!("undefined macvlan mode: {}", mode),
    }
}

/// A macvlan device stacked on a parent link. The parent index travels
/// outside the kind payload as a top-level IFLA_LINK attribute.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Macvlan {
    pub mode: MacvlanMode,
    pub link: u32,
}

impl Macvlan {
    pub(crate) fn marshal(&self) -> NetlinkRouteAttr {
        let mut data = NetlinkRouteAttr::new(consts::IFLA_INFO_DATA, vec![]);
        data.add_child(
            consts::IFLA_MACVLAN_MODE,
            (self.mode as u32).to_ne_bytes().to_vec(),
        );
        data
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut macvlan = Macvlan::default();

        for attr in NetlinkRouteAttr::from(buf)? {
            if attr.rta_type() == consts::IFLA_MACVLAN_MODE {
                macvlan.mode = MacvlanMode::from_raw(attr.as_u32()?);
            }
        }

        Ok(macvlan)
    }

    pub fn satisfies(&self, spec: &Macvlan) -> bool {
        (spec.mode == MacvlanMode::Unspec || self.mode == spec.mode)
            && u32_sat(self.link, spec.link)
    }
}
