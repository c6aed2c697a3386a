// SPDX-License-Identifier: AGPL-3.0-only

//! Raw ioctl surface
//!
//! [`dispatch`] takes a command number and its packed little-endian payload,
//! runs it against one endpoint and returns `0` or a negative errno. The
//! typed [`Request`] sits in between; callers can build one and
//! [`Request::encode`] it to get the exact payload image.

use crate::dma::DmaDirection;
use crate::endpoint::{Endpoint, SubdeviceInfo, WaitOpts};
use crate::error::{EpfError, Result};
use crate::pci_test::TestHost;
use crate::plane::Transfer;
use crate::wait::CancelToken;
use bytes::{Buf, BufMut, BytesMut};
use epf_proto::ioctl::{bsb, dir, ioc_size, ioc_type, neko, pcitest};
use epf_proto::limits::MAX_SUB;
use epf_proto::Side;

/// A decoded ioctl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// RC: publish `msg2ep` and wait for the EP's reply
    Exchange {
        /// Subdevice slot
        idx: usize,
        /// Value published in `sz_msg2ep`
        msg2ep: u32,
    },
    /// EP: wait for the RC's next `msg2ep`
    WaitMsg2Ep {
        /// Subdevice slot
        idx: usize,
    },
    /// Both: subdevice count and regions
    SubdevicesInfo,
    /// EP: EP-OB or EP-IB
    EpXfer {
        /// Transfer arguments
        xfer: Transfer,
        /// Outbound or inbound
        dir: DmaDirection,
    },
    /// EP: publish `msg2rc` and ring the RC
    Msg2Rc {
        /// Subdevice slot
        idx: usize,
        /// Value published in `sz_msg2rc`
        msg2rc: u32,
    },
    /// RC: RC-OB or RC-IB
    RcXfer {
        /// Transfer arguments, `remote` is an offset in the EP window
        xfer: Transfer,
        /// Outbound or inbound
        dir: DmaDirection,
    },
    /// EP: advertise a buffer of the memory BAR
    PublishWindow {
        /// Subdevice slot
        idx: usize,
        /// Local bus address
        local: u64,
        /// Window size
        size: usize,
        /// Value published in `sz_msg2rc`
        msg2rc: u32,
    },
    /// EP: single-direction transfer on subdevice 0
    RawXfer {
        /// RC bus address
        remote: u64,
        /// Local bus address
        local: u64,
        /// Length in bytes
        len: usize,
        /// Outbound or inbound
        dir: DmaDirection,
    },
    /// RC: PCI test command with its `u64` argument
    PciTest {
        /// `'P'` command number
        cmd: u32,
        /// Argument (BAR index, vector, size or irq type)
        arg: u64,
    },
}

fn decode_dir(raw: u32) -> Result<DmaDirection> {
    match raw {
        dir::OUTBOUND => Ok(DmaDirection::MemToDev),
        dir::INBOUND => Ok(DmaDirection::DevToMem),
        other => Err(EpfError::invalid_argument(format!("transfer direction {other}"))),
    }
}

const fn encode_dir(d: DmaDirection) -> u32 {
    match d {
        DmaDirection::MemToDev => dir::OUTBOUND,
        DmaDirection::DevToMem => dir::INBOUND,
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn word(v: usize) -> u32 {
    v as u32
}

/// Payload length a command needs
#[must_use]
pub fn payload_size(cmd: u32) -> usize {
    if ioc_type(cmd) == pcitest::TYPE {
        pcitest::ARG_SIZE
    } else {
        ioc_size(cmd)
    }
}

impl Request {
    /// Decode `cmd` and its payload for an endpoint on `side`
    ///
    /// # Errors
    ///
    /// `NotSupported` for an unknown command or one meant for the other
    /// side; `InvalidArgument` for a short payload or a bad direction.
    pub fn decode(side: Side, cmd: u32, arg: &[u8]) -> Result<Self> {
        let req_side = match cmd {
            bsb::RC_EXCHANGE | bsb::RC_XFER => Some(Side::Rc),
            bsb::EP_WAIT_MSG2EP
            | bsb::EP_XFER
            | bsb::EP_MSG2RC
            | bsb::EP_PUBLISH_WINDOW
            | neko::XFER => Some(Side::Ep),
            bsb::SUBDEVICES_INFO => None,
            c if is_pcitest(c) => Some(Side::Rc),
            c => return Err(EpfError::not_supported(format!("ioctl {c:#010x}"))),
        };
        if let Some(s) = req_side {
            if s != side {
                return Err(EpfError::not_supported(format!(
                    "ioctl {cmd:#010x} on the {side} side"
                )));
            }
        }
        let need = payload_size(cmd);
        if arg.len() < need {
            return Err(EpfError::invalid_argument(format!(
                "ioctl {cmd:#010x}: payload {} bytes, needs {need}",
                arg.len()
            )));
        }

        let mut buf = &arg[..need];
        let req = match cmd {
            bsb::RC_EXCHANGE => {
                let msg2ep = buf.get_u32_le();
                let _msg2rc = buf.get_u32_le();
                let idx = buf.get_u32_le() as usize;
                Self::Exchange { idx, msg2ep }
            }
            bsb::EP_WAIT_MSG2EP => Self::WaitMsg2Ep {
                idx: buf.get_u32_le() as usize,
            },
            bsb::SUBDEVICES_INFO => Self::SubdevicesInfo,
            bsb::EP_XFER | bsb::RC_XFER => {
                let remote = buf.get_u64_le();
                let local = buf.get_u64_le();
                let len = buf.get_u32_le() as usize;
                let dir = decode_dir(buf.get_u32_le())?;
                let idx = buf.get_u32_le() as usize;
                let xfer = Transfer::new(idx, local, remote, len);
                if cmd == bsb::EP_XFER {
                    Self::EpXfer { xfer, dir }
                } else {
                    Self::RcXfer { xfer, dir }
                }
            }
            bsb::EP_MSG2RC => {
                let msg2rc = buf.get_u32_le();
                let idx = buf.get_u32_le() as usize;
                Self::Msg2Rc { idx, msg2rc }
            }
            bsb::EP_PUBLISH_WINDOW => {
                let local = buf.get_u64_le();
                let size = buf.get_u32_le() as usize;
                let idx = buf.get_u32_le() as usize;
                let msg2rc = buf.get_u32_le();
                Self::PublishWindow {
                    idx,
                    local,
                    size,
                    msg2rc,
                }
            }
            neko::XFER => {
                let remote = buf.get_u64_le();
                let local = buf.get_u64_le();
                let len = buf.get_u32_le() as usize;
                let dir = decode_dir(buf.get_u32_le())?;
                Self::RawXfer {
                    remote,
                    local,
                    len,
                    dir,
                }
            }
            _ => Self::PciTest {
                cmd,
                arg: buf.get_u64_le(),
            },
        };
        Ok(req)
    }

    /// Command number of this request
    #[must_use]
    pub const fn command(&self) -> u32 {
        match self {
            Self::Exchange { .. } => bsb::RC_EXCHANGE,
            Self::WaitMsg2Ep { .. } => bsb::EP_WAIT_MSG2EP,
            Self::SubdevicesInfo => bsb::SUBDEVICES_INFO,
            Self::EpXfer { .. } => bsb::EP_XFER,
            Self::Msg2Rc { .. } => bsb::EP_MSG2RC,
            Self::RcXfer { .. } => bsb::RC_XFER,
            Self::PublishWindow { .. } => bsb::EP_PUBLISH_WINDOW,
            Self::RawXfer { .. } => neko::XFER,
            Self::PciTest { cmd, .. } => *cmd,
        }
    }

    /// Packed payload image of this request
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(payload_size(self.command()));
        match *self {
            Self::Exchange { idx, msg2ep } => {
                out.put_u32_le(msg2ep);
                out.put_u32_le(0);
                out.put_u32_le(word(idx));
            }
            Self::WaitMsg2Ep { idx } => {
                out.put_u32_le(word(idx));
                out.put_u32_le(0);
            }
            Self::SubdevicesInfo => out.put_bytes(0, bsb::INFO_SIZE),
            Self::EpXfer { xfer, dir } | Self::RcXfer { xfer, dir } => {
                out.put_u64_le(xfer.remote);
                out.put_u64_le(xfer.local);
                out.put_u32_le(word(xfer.len));
                out.put_u32_le(encode_dir(dir));
                out.put_u32_le(word(xfer.idx));
                out.put_u32_le(0);
            }
            Self::Msg2Rc { idx, msg2rc } => {
                out.put_u32_le(msg2rc);
                out.put_u32_le(word(idx));
            }
            Self::PublishWindow {
                idx,
                local,
                size,
                msg2rc,
            } => {
                out.put_u64_le(local);
                out.put_u32_le(word(size));
                out.put_u32_le(word(idx));
                out.put_u32_le(msg2rc);
                out.put_u32_le(0);
            }
            Self::RawXfer {
                remote,
                local,
                len,
                dir,
            } => {
                out.put_u64_le(remote);
                out.put_u64_le(local);
                out.put_u32_le(word(len));
                out.put_u32_le(encode_dir(dir));
            }
            Self::PciTest { arg, .. } => out.put_u64_le(arg),
        }
        out
    }
}

const fn is_pcitest(cmd: u32) -> bool {
    matches!(
        cmd,
        pcitest::BAR
            | pcitest::LEGACY_IRQ
            | pcitest::MSI
            | pcitest::WRITE
            | pcitest::READ
            | pcitest::COPY
            | pcitest::MSIX
            | pcitest::SET_IRQTYPE
            | pcitest::GET_IRQTYPE
            | pcitest::CLEAR_IRQ
            | pcitest::BARS
    )
}

/// Packed `SUBDEVICES_INFO` image
#[must_use]
pub fn encode_info(info: &SubdeviceInfo) -> BytesMut {
    let mut out = BytesMut::with_capacity(bsb::INFO_SIZE);
    out.put_u32_le(info.nr);
    for &(start, size) in &info.regions {
        out.put_u64_le(start);
        out.put_u32_le(size);
    }
    out
}

/// Parse a `SUBDEVICES_INFO` reply
///
/// # Errors
///
/// `InvalidArgument` for a short buffer.
pub fn decode_info(arg: &[u8]) -> Result<SubdeviceInfo> {
    if arg.len() < bsb::INFO_SIZE {
        return Err(EpfError::invalid_argument(format!(
            "info payload {} bytes, needs {}",
            arg.len(),
            bsb::INFO_SIZE
        )));
    }
    let mut buf = &arg[..bsb::INFO_SIZE];
    let nr = buf.get_u32_le();
    let mut regions = [(0u64, 0u32); MAX_SUB];
    for r in &mut regions {
        *r = (buf.get_u64_le(), buf.get_u32_le());
    }
    Ok(SubdeviceInfo { nr, regions })
}

fn usize_arg(arg: u64) -> Result<usize> {
    usize::try_from(arg).map_err(|_| EpfError::invalid_argument(format!("argument {arg:#x}")))
}

fn u32_arg(arg: u64) -> Result<u32> {
    u32::try_from(arg).map_err(|_| EpfError::invalid_argument(format!("argument {arg:#x}")))
}

/// Run `req` on `endpoint`, writing any reply into `arg`
///
/// # Errors
///
/// Whatever the operation returns; `NotSupported` for PCI test commands on
/// an endpoint without a [`TestHost`].
pub fn execute(
    endpoint: &Endpoint,
    test: Option<&TestHost>,
    req: Request,
    arg: &mut [u8],
    cancel: Option<&CancelToken>,
) -> Result<()> {
    let need = payload_size(req.command());
    if arg.len() < need {
        return Err(EpfError::invalid_argument(format!(
            "reply buffer {} bytes, needs {need}",
            arg.len()
        )));
    }
    let opts = WaitOpts {
        deadline: None,
        cancel,
    };
    match req {
        Request::Exchange { idx, msg2ep } => {
            let msg2rc = endpoint.exchange(idx, msg2ep, opts)?;
            arg[4..8].copy_from_slice(&msg2rc.to_le_bytes());
        }
        Request::WaitMsg2Ep { idx } => {
            let msg2ep = endpoint.wait_msg2ep(idx, opts)?;
            arg[4..8].copy_from_slice(&msg2ep.to_le_bytes());
        }
        Request::SubdevicesInfo => {
            let image = encode_info(&endpoint.subdevices_info()?);
            arg[..image.len()].copy_from_slice(&image);
        }
        Request::EpXfer { xfer, dir } => match dir {
            DmaDirection::MemToDev => endpoint.ep_outbound(&xfer, opts)?,
            DmaDirection::DevToMem => endpoint.ep_inbound(&xfer, opts)?,
        },
        Request::Msg2Rc { idx, msg2rc } => endpoint.msg2rc(idx, msg2rc)?,
        Request::RcXfer { xfer, dir } => match dir {
            DmaDirection::MemToDev => endpoint.rc_outbound(&xfer, opts)?,
            DmaDirection::DevToMem => endpoint.rc_inbound(&xfer, opts)?,
        },
        Request::PublishWindow {
            idx,
            local,
            size,
            msg2rc,
        } => endpoint.publish_window(idx, local, size, msg2rc)?,
        Request::RawXfer {
            remote,
            local,
            len,
            dir,
        } => endpoint.raw_transfer(remote, local, len, dir)?,
        Request::PciTest { cmd, arg: value } => {
            let host =
                test.ok_or_else(|| EpfError::not_supported("PCI test host not attached"))?;
            match cmd {
                pcitest::BAR => host.bar(endpoint, usize_arg(value)?)?,
                pcitest::BARS => host.bars(endpoint)?,
                pcitest::LEGACY_IRQ => host.legacy_irq(endpoint)?,
                pcitest::MSI => host.msi(endpoint, u32_arg(value)?)?,
                pcitest::MSIX => host.msix(endpoint, u32_arg(value)?)?,
                pcitest::WRITE => host.write(endpoint, usize_arg(value)?)?,
                pcitest::READ => host.read(endpoint, usize_arg(value)?)?,
                pcitest::COPY => host.copy(endpoint, usize_arg(value)?)?,
                pcitest::SET_IRQTYPE => host.set_irq_type(u32_arg(value)?)?,
                pcitest::GET_IRQTYPE => {
                    let ty = host
                        .irq_type()
                        .ok_or_else(|| EpfError::invalid_argument("no interrupt type set"))?;
                    arg[..8].copy_from_slice(&u64::from(ty).to_le_bytes());
                }
                pcitest::CLEAR_IRQ => host.clear_irq(),
                other => return Err(EpfError::not_supported(format!("ioctl {other:#010x}"))),
            }
        }
    }
    Ok(())
}

/// Decode and run one ioctl; `0` on success, a negative errno otherwise
pub fn dispatch(
    endpoint: &Endpoint,
    test: Option<&TestHost>,
    cmd: u32,
    arg: &mut [u8],
    cancel: Option<&CancelToken>,
) -> i32 {
    let result = Request::decode(endpoint.side(), cmd, arg)
        .and_then(|req| execute(endpoint, test, req, arg, cancel));
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::debug!("{} ioctl {cmd:#010x}: {e}", endpoint.side());
            e.errno()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_and_unknown_commands_are_not_supported() {
        let args = [0u8; 64];
        let err = Request::decode(Side::Ep, bsb::RC_EXCHANGE, &args).unwrap_err();
        assert!(matches!(err, EpfError::NotSupported { .. }));
        let err = Request::decode(Side::Rc, bsb::EP_XFER, &args).unwrap_err();
        assert!(matches!(err, EpfError::NotSupported { .. }));
        let err = Request::decode(Side::Rc, pcitest::BAR + 0x40, &args).unwrap_err();
        assert_eq!(err.errno(), -libc::EOPNOTSUPP);
        let err = Request::decode(Side::Rc, 0xdead_beef, &args).unwrap_err();
        assert_eq!(err.errno(), -libc::EOPNOTSUPP);
    }

    #[test]
    fn short_payload_is_invalid() {
        let err = Request::decode(Side::Ep, bsb::EP_XFER, &[0u8; 31]).unwrap_err();
        assert!(matches!(err, EpfError::InvalidArgument { .. }));
        let err = Request::decode(Side::Rc, pcitest::BARS, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, EpfError::InvalidArgument { .. }));
    }

    #[test]
    fn xfer_payload_layout() {
        let mut arg = Vec::new();
        arg.extend_from_slice(&0x8000_0100u64.to_le_bytes());
        arg.extend_from_slice(&0x1_0000_0040u64.to_le_bytes());
        arg.extend_from_slice(&0x1000u32.to_le_bytes());
        arg.extend_from_slice(&dir::INBOUND.to_le_bytes());
        arg.extend_from_slice(&7u32.to_le_bytes());
        arg.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(arg.len(), bsb::XFER_SIZE);

        let req = Request::decode(Side::Ep, bsb::EP_XFER, &arg).unwrap();
        assert_eq!(
            req,
            Request::EpXfer {
                xfer: Transfer::new(7, 0x1_0000_0040, 0x8000_0100, 0x1000),
                dir: DmaDirection::DevToMem,
            }
        );
        assert_eq!(&req.encode()[..], &arg[..]);
    }

    #[test]
    fn msg2rc_and_xfer_share_a_number_but_not_a_size() {
        let req = Request::Msg2Rc { idx: 3, msg2rc: 99 };
        let image = req.encode();
        assert_eq!(image.len(), bsb::MSG2RC_SIZE);
        assert_eq!(Request::decode(Side::Ep, bsb::EP_MSG2RC, &image).unwrap(), req);
    }

    #[test]
    fn bad_direction_rejected() {
        let mut arg = Request::RawXfer {
            remote: 0,
            local: 0,
            len: 8,
            dir: DmaDirection::MemToDev,
        }
        .encode();
        arg[20] = 2;
        let err = Request::decode(Side::Ep, neko::XFER, &arg).unwrap_err();
        assert!(matches!(err, EpfError::InvalidArgument { .. }));
    }

    #[test]
    fn info_image_is_packed() {
        let mut info = SubdeviceInfo {
            nr: 2,
            regions: [(0, 0); MAX_SUB],
        };
        info.regions[0] = (0x8000_0000, 0x10_0000);
        info.regions[1] = (0x8010_0000, 0x10_0000);
        let image = encode_info(&info);
        assert_eq!(image.len(), 196);
        assert_eq!(&image[4..12], &0x8000_0000u64.to_le_bytes());
        assert_eq!(&image[16..24], &0x8010_0000u64.to_le_bytes());
        assert_eq!(decode_info(&image).unwrap(), info);
    }
}
