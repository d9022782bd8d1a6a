use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::{
    consts,
    context::Context,
    error::Error,
    request::NetlinkRequest,
    socket::NetlinkSocket,
};

/// A routing socket dialed for one operation. Handles are never shared or
/// retained across calls: dial, execute, drop.
pub struct SocketHandle {
    pub seq: u32,
    pub socket: NetlinkSocket,
}

impl SocketHandle {
    /// Dial a routing socket inside the context's namespace.
    pub fn dial(ctx: &Context) -> Result<Self> {
        Ok(Self {
            seq: 0,
            socket: ctx.dial(libc::NETLINK_ROUTE)?,
        })
    }

    /// Send one request and collect the reply messages.
    ///
    /// Replies are matched on sequence number and port id. An error frame
    /// carries a 4-byte status code: zero is a pure acknowledgement,
    /// nonzero becomes [`Error::Kernel`] with the kernel's own text for
    /// that code. When `res_type` is nonzero, replies of any other type
    /// are dropped.
    pub fn execute(&mut self, req: &mut NetlinkRequest, res_type: u16) -> Result<Vec<Vec<u8>>> {
        req.header.nlmsg_seq = {
            self.seq += 1;
            self.seq
        };

        let buf = req.serialize()?;

        self.socket.send(&buf)?;

        let pid = self.socket.pid()?;
        let mut res: Vec<Vec<u8>> = Vec::new();

        'done: loop {
            let (msgs, from) = self.socket.recv()?;

            if from.nl_pid != consts::PID_KERNEL {
                bail!(
                    "wrong sender pid: {}, expected: {}",
                    from.nl_pid,
                    consts::PID_KERNEL
                );
            }

            for m in msgs {
                if m.header.nlmsg_seq != req.header.nlmsg_seq {
                    continue;
                }

                if m.header.nlmsg_pid != pid {
                    continue;
                }

                match m.header.nlmsg_type {
                    consts::NLMSG_DONE | consts::NLMSG_ERROR => {
                        let err_no = match m.data.get(0..4) {
                            Some(code) => i32::from_ne_bytes(code.try_into()?),
                            None => 0,
                        };

                        if err_no == 0 {
                            debug!(seq = m.header.nlmsg_seq, "netlink request acknowledged");
                            break 'done;
                        }

                        let err = Error::from_ack_code(err_no);
                        warn!(code = -err_no, "netlink request failed");
                        bail!(err);
                    }
                    t if res_type != 0 && t != res_type => {
                        continue;
                    }
                    _ => {
                        res.push(m.data);
                    }
                }

                if m.header.nlmsg_flags & libc::NLM_F_MULTI as u16 == 0 {
                    break 'done;
                }
            }
        }

        Ok(res)
    }

    /// Execute a batch of mutation requests strictly in submission order
    /// over this one socket. A failure on any request aborts the rest of
    /// the batch; there is no rollback of the requests already applied.
    pub fn update(&mut self, reqs: &mut [NetlinkRequest]) -> Result<()> {
        for req in reqs {
            let _ = self.execute(req, 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InfoMessage, NetlinkRouteAttr};
    use crate::test_setup;

    #[test]
    fn test_execute_dump() {
        test_setup!();
        let ctx = Context::open_default().unwrap();
        let mut handle = SocketHandle::dial(&ctx).unwrap();

        let mut req = NetlinkRequest::new(libc::RTM_GETLINK, libc::NLM_F_DUMP);
        req.add_data(Box::new(InfoMessage::new(libc::AF_UNSPEC)));

        let msgs = handle.execute(&mut req, libc::RTM_NEWLINK).unwrap();
        assert!(!msgs.is_empty());

        let msg = InfoMessage::deserialize(&msgs[0]).unwrap();
        assert_eq!(msg.index, 1);
    }

    #[test]
    fn test_execute_kernel_error() {
        test_setup!();
        let ctx = Context::open_default().unwrap();
        let mut handle = SocketHandle::dial(&ctx).unwrap();

        // deleting a link that does not exist surfaces ENODEV
        let mut req = NetlinkRequest::new(libc::RTM_DELLINK, libc::NLM_F_ACK);
        req.add_data(Box::new(InfoMessage::new(libc::AF_UNSPEC)));
        req.add_data(Box::new(NetlinkRouteAttr::new(
            libc::IFLA_IFNAME,
            crate::utils::zero_terminated("nope0"),
        )));

        let err = handle.execute(&mut req, 0).err().unwrap();
        assert!(crate::error::is_not_found(&err));
    }

    #[test]
    fn test_update_aborts_on_failure() {
        test_setup!();
        let ctx = Context::open_default().unwrap();
        let mut handle = SocketHandle::dial(&ctx).unwrap();

        let del = |name: &str| {
            let mut req = NetlinkRequest::new(libc::RTM_DELLINK, libc::NLM_F_ACK);
            req.add_data(Box::new(InfoMessage::new(libc::AF_UNSPEC)));
            req.add_data(Box::new(NetlinkRouteAttr::new(
                libc::IFLA_IFNAME,
                crate::utils::zero_terminated(name),
            )));
            req
        };

        let mut batch = vec![del("nope0"), del("nope1")];
        let err = handle.update(&mut batch).err().unwrap();
        assert!(crate::error::is_not_found(&err));
    }
}
