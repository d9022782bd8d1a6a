use anyhow::Result;

use crate::message::NetlinkMessageHeader;

pub trait NetlinkRequestData {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn serialize(&self) -> Result<Vec<u8>>;
}

pub struct NetlinkRequest {
    pub header: NetlinkMessageHeader,
    pub data: Option<Vec<Box<dyn NetlinkRequestData>>>,
    pub raw_data: Option<Vec<u8>>,
}

impl NetlinkRequest {
    pub fn new(proto: u16, flags: i32) -> Self {
        Self {
            header: NetlinkMessageHeader::new(proto, flags),
            data: None,
            raw_data: None,
        }
    }

    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend(bincode::serialize(&self.header)?);

        if let Some(data) = &self.data {
            for d in data {
                buf.extend(d.serialize()?);
            }
        }
        if let Some(data) = &self.raw_data {
            buf.extend(data);
        }

        let len = buf.len() as u32;
        buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.header.nlmsg_len = len;

        Ok(buf)
    }

    pub fn add_data(&mut self, data: Box<dyn NetlinkRequestData>) {
        self.header.nlmsg_len += data.len() as u32;
        if self.data.is_none() {
            self.data = Some(vec![data]);
        } else if let Some(d) = &mut self.data {
            d.push(data);
        }
    }

    pub fn add_raw_data(&mut self, data: Vec<u8>) {
        self.header.nlmsg_len += data.len() as u32;
        if self.raw_data.is_none() {
            self.raw_data = Some(data);
        } else if let Some(d) = &mut self.raw_data {
            d.extend(data);
        }
    }
}
