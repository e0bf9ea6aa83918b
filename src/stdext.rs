//! Small pieces of libc that std would normally wrap for us.

use core::ffi::{self, CStr};

use crate::{Error, Result, PATH_CAPACITY};

pub(crate) fn errno() -> i32 {
    // SAFETY: Surely errno_location would be valid, right?
    unsafe { *libc::__errno_location() }
}

pub(crate) fn clear_errno() {
    // SAFETY: see above, it's a thread local int.
    unsafe { *libc::__errno_location() = 0 };
}

pub(crate) fn with_last_os_error_str<R>(f: impl FnOnce(&str) -> R) -> R {
    let mut buf: [u8; 512] = [0; 512];

    // SAFETY: Our buffer length is passed correctly
    let error = unsafe { libc::strerror_r(errno(), buf.as_mut_ptr().cast(), buf.len()) };
    let cstr = if error != 0 {
        c"<strerror_r returned an error>"
    } else {
        // SAFETY: strerror_r writes the string to buf, even if it didnt write anything, we did zero init it.
        unsafe { CStr::from_ptr(buf.as_ptr().cast()) }
    };
    f(cstr
        .to_str()
        .unwrap_or("<error message contained invalid utf8>"))
}

/// Copies `path` into `buf` with a NUL terminator.
pub(crate) fn path_cstr<'b>(path: &str, buf: &'b mut [u8; PATH_CAPACITY + 1]) -> Result<&'b CStr> {
    let bytes = path.as_bytes();
    if bytes.len() > PATH_CAPACITY || bytes.contains(&0) {
        return Err(Error::PathTooLong);
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    buf[bytes.len()] = 0;
    CStr::from_bytes_with_nul(&buf[..=bytes.len()]).map_err(|_| Error::PathTooLong)
}

/// An owned file descriptor, closed on drop.
#[derive(Debug)]
pub(crate) struct Fd(ffi::c_int);

impl Fd {
    pub(crate) fn open_read_only(path: &CStr) -> Result<Fd> {
        // SAFETY: path is a valid C string.
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            with_last_os_error_str(|err| trace!(?path, "open failed: {err}"));
            return Err(Error::Os(errno()));
        }
        Ok(Fd(fd))
    }

    pub(crate) fn raw(&self) -> ffi::c_int {
        self.0
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            // SAFETY: the buffer length is passed correctly.
            let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = errno();
            if errno != libc::EINTR {
                return Err(Error::Os(errno));
            }
        }
    }

    pub(crate) fn size(&self) -> Result<usize> {
        // SAFETY: all zeroes is a valid stat.
        let mut stat: libc::stat = unsafe { core::mem::zeroed() };
        // SAFETY: stat points to a valid struct.
        if unsafe { libc::fstat(self.0, &mut stat) } != 0 {
            return Err(Error::Os(errno()));
        }
        Ok(stat.st_size as usize)
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        // SAFETY: we own the descriptor.
        unsafe { libc::close(self.0) };
    }
}

/// Calls `f` with every line of the file at `path`, without the newline.
///
/// Lines longer than the internal buffer are cut at the buffer size.
pub(crate) fn for_each_line(path: &CStr, mut f: impl FnMut(&[u8])) -> Result<()> {
    let fd = Fd::open_read_only(path)?;
    let mut buf = [0u8; 4096];
    let mut filled = 0;

    loop {
        let n = fd.read(&mut buf[filled..])?;
        if n == 0 {
            if filled > 0 {
                f(&buf[..filled]);
            }
            return Ok(());
        }
        filled += n;

        let mut consumed = 0;
        while let Some(newline) = buf[consumed..filled].iter().position(|&b| b == b'\n') {
            f(&buf[consumed..consumed + newline]);
            consumed += newline + 1;
        }
        buf.copy_within(consumed..filled, 0);
        filled -= consumed;

        if filled == buf.len() {
            f(&buf);
            filled = 0;
        }
    }
}
