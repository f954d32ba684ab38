use std::{io, os::fd::RawFd};

/// Executes the `ioctl` syscall on the given file descriptor with the provided request.
///
/// # Safety
///
/// The file descriptor must be open.
pub unsafe fn exec<P>(fd: RawFd, code: libc::c_ulong, req: &mut Request<P>) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, code as _, req) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Represents a control request to an IO device, addressed by the device's name.
///
/// The payload MUST also be `#[repr(C)]` and its layout depends on the particular request you are sending.
#[repr(C)]
pub struct Request<P> {
    name: [std::ffi::c_uchar; libc::IF_NAMESIZE],
    payload: P,
}

impl Request<SetTunFlagsPayload> {
    pub fn new(name: &str) -> Self {
        let name_as_bytes = name.as_bytes();
        debug_assert!(name_as_bytes.len() < libc::IF_NAMESIZE);

        let mut name_buf = [0u8; libc::IF_NAMESIZE];
        name_buf[..name_as_bytes.len()].copy_from_slice(name_as_bytes);

        Self {
            name: name_buf,
            payload: SetTunFlagsPayload {
                flags: (libc::IFF_TUN | libc::IFF_NO_PI | libc::IFF_MULTI_QUEUE) as _,
            },
        }
    }
}

impl Request<GetInterfaceMtuPayload> {
    pub fn new(name: &str) -> io::Result<Self> {
        if name.len() >= libc::IF_NAMESIZE {
            return Err(io::ErrorKind::InvalidInput.into());
        }

        let mut name_buf = [0u8; libc::IF_NAMESIZE];
        name_buf[..name.len()].copy_from_slice(name.as_bytes());

        Ok(Self {
            name: name_buf,
            payload: Default::default(),
        })
    }

    pub fn mtu(&self) -> usize {
        self.payload.mtu as usize
    }
}

#[repr(C)]
pub struct SetTunFlagsPayload {
    flags: std::ffi::c_short,
}

#[derive(Default)]
#[repr(C)]
pub struct GetInterfaceMtuPayload {
    mtu: libc::c_int,
}
