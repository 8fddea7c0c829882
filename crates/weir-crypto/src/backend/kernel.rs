//! AES-CTR backend backed by the Linux kernel crypto API (AF_ALG).
//!
//! A `set_key` binds an `skcipher` transform socket to `ctr(aes)`,
//! installs the key, and accepts one operation socket. Each transform is
//! a single sendmsg carrying the IV and the payload, followed by reading
//! the result back into the payload buffer. One-shot requests suit
//! packet-sized payloads; this backend is not meant for bulk streams.

#![allow(unsafe_code)]

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use super::{BackendError, CtrBackend};
use crate::psk::KeySize;

const IV_LEN: usize = 16;

/// Kernel skcipher cipher handle.
#[derive(Default)]
pub(crate) struct KernelAes {
    session: Option<Session>,
}

struct Session {
    /// Transform socket bound to `ctr(aes)`; holds the installed key.
    _tfm: OwnedFd,
    /// Operation socket the per-packet requests go through.
    op: OwnedFd,
}

impl CtrBackend for KernelAes {
    fn set_key(&mut self, key: &[u8], size: KeySize) -> Result<(), BackendError> {
        if key.len() != size.bytes() {
            return Err(BackendError::KeySetup(format!(
                "expected {} key bytes, got {}",
                size.bytes(),
                key.len()
            )));
        }

        let tfm = alg_socket()?;
        bind_skcipher(&tfm)?;

        let rc = unsafe {
            libc::setsockopt(
                tfm.as_raw_fd(),
                libc::SOL_ALG,
                libc::ALG_SET_KEY,
                key.as_ptr() as *const libc::c_void,
                key.len() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(BackendError::KeySetup(last_os_error("ALG_SET_KEY")));
        }

        let op_fd = unsafe {
            libc::accept4(
                tfm.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if op_fd < 0 {
            return Err(BackendError::KeySetup(last_os_error("accept4")));
        }
        let op = unsafe { OwnedFd::from_raw_fd(op_fd) };

        // Replacing the session closes any previously keyed sockets.
        self.session = Some(Session { _tfm: tfm, op });
        Ok(())
    }

    fn xor_keystream(&mut self, iv: &[u8; 16], payload: &mut [u8]) -> Result<(), BackendError> {
        let session = self.session.as_ref().ok_or(BackendError::Unkeyed)?;
        if payload.is_empty() {
            return Ok(());
        }

        send_request(&session.op, iv, payload)?;
        read_response(&session.op, payload)
    }
}

fn alg_socket() -> Result<OwnedFd, BackendError> {
    let fd = unsafe {
        libc::socket(
            libc::AF_ALG,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(BackendError::KeySetup(last_os_error("socket")));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind_skcipher(tfm: &OwnedFd) -> Result<(), BackendError> {
    let mut addr: libc::sockaddr_alg = unsafe { std::mem::zeroed() };
    addr.salg_family = libc::AF_ALG as libc::sa_family_t;
    addr.salg_type[..8].copy_from_slice(b"skcipher");
    addr.salg_name[..8].copy_from_slice(b"ctr(aes)");

    let rc = unsafe {
        libc::bind(
            tfm.as_raw_fd(),
            &addr as *const libc::sockaddr_alg as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_alg>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(BackendError::KeySetup(last_os_error("bind")));
    }
    Ok(())
}

/// One sendmsg per packet: ALG_SET_OP and ALG_SET_IV control messages,
/// payload in the iovec.
fn send_request(op: &OwnedFd, iv: &[u8; 16], payload: &mut [u8]) -> Result<(), BackendError> {
    let op_len = std::mem::size_of::<u32>();
    let iv_len = std::mem::size_of::<libc::af_alg_iv>() + IV_LEN;
    let op_space = unsafe { libc::CMSG_SPACE(op_len as u32) } as usize;
    let iv_space = unsafe { libc::CMSG_SPACE(iv_len as u32) } as usize;
    let controllen = op_space + iv_space;

    // u64 backing keeps the control buffer aligned for cmsghdr access.
    let mut control = vec![0u64; controllen.div_ceil(8)];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = controllen as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(BackendError::Transform("control buffer too small".into()));
        }
        (*cmsg).cmsg_level = libc::SOL_ALG;
        (*cmsg).cmsg_type = libc::ALG_SET_OP;
        (*cmsg).cmsg_len = libc::CMSG_LEN(op_len as u32) as _;
        // CTR encrypt and decrypt are the same keystream XOR.
        std::ptr::write_unaligned(
            libc::CMSG_DATA(cmsg) as *mut u32,
            libc::ALG_OP_ENCRYPT as u32,
        );

        let cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        if cmsg.is_null() {
            return Err(BackendError::Transform("control buffer too small".into()));
        }
        (*cmsg).cmsg_level = libc::SOL_ALG;
        (*cmsg).cmsg_type = libc::ALG_SET_IV;
        (*cmsg).cmsg_len = libc::CMSG_LEN(iv_len as u32) as _;
        let data = libc::CMSG_DATA(cmsg);
        std::ptr::write_unaligned(data as *mut u32, IV_LEN as u32);
        std::ptr::copy_nonoverlapping(
            iv.as_ptr(),
            data.add(std::mem::size_of::<libc::af_alg_iv>()),
            IV_LEN,
        );
    }

    let sent = unsafe { libc::sendmsg(op.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(BackendError::Transform(last_os_error("sendmsg")));
    }
    if sent as usize != payload.len() {
        return Err(BackendError::Transform(format!(
            "short request: {sent} of {} bytes",
            payload.len()
        )));
    }
    Ok(())
}

fn read_response(op: &OwnedFd, payload: &mut [u8]) -> Result<(), BackendError> {
    let mut done = 0;
    while done < payload.len() {
        let n = unsafe {
            libc::read(
                op.as_raw_fd(),
                payload[done..].as_mut_ptr() as *mut libc::c_void,
                payload.len() - done,
            )
        };
        if n <= 0 {
            return Err(BackendError::Transform(last_os_error("read")));
        }
        done += n as usize;
    }
    Ok(())
}

fn last_os_error(what: &str) -> String {
    format!("{what}: {}", std::io::Error::last_os_error())
}
