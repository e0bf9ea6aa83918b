//! Bounds-checked reads from our own address space or from a traced process.
//!
//! Unwind data is semi-trusted: a corrupt `.eh_frame` can point anywhere, and
//! the unwinder may be running inside a signal handler where a stray read
//! turns one crash into two. Every read therefore goes through a
//! [`MemoryView`] that knows which window `[base, base + size)` it may touch.


use core::marker::PhantomData;
use core::mem::size_of;

use crate::{stdext, Error, Result};

/// How the bytes behind a view are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reader {
    /// Plain memory copies from this process.
    Local,
    /// `PTRACE_PEEKDATA` against a stopped tracee.
    Remote { pid: libc::pid_t },
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryView<'a> {
    base: usize,
    size: usize,
    reader: Reader,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> MemoryView<'a> {
    /// A view over bytes we already hold.
    pub fn for_slice(bytes: &'a [u8]) -> Self {
        Self {
            base: bytes.as_ptr().expose_provenance(),
            size: bytes.len(),
            reader: Reader::Local,
            _marker: PhantomData,
        }
    }

    /// The whole address space of a stopped tracee.
    pub fn remote(pid: libc::pid_t) -> MemoryView<'static> {
        MemoryView {
            base: 0,
            size: usize::MAX,
            reader: Reader::Remote { pid },
            _marker: PhantomData,
        }
    }

    /// A window over memory in this process.
    ///
    /// # Safety
    /// `[base, base + size)` must stay readable for as long as the view (or
    /// anything derived from it) is used.
    pub unsafe fn local(base: usize, size: usize) -> MemoryView<'static> {
        MemoryView {
            base,
            size,
            reader: Reader::Local,
            _marker: PhantomData,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn reader(&self) -> Reader {
        self.reader
    }

    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base && len <= self.size && addr - self.base <= self.size - len
    }

    fn check(&self, addr: usize, len: usize) -> Result<()> {
        if self.contains(addr, len) {
            Ok(())
        } else {
            Err(Error::OutOfBounds { addr, len })
        }
    }

    /// A narrower window inside this one, read the same way.
    pub fn subview(&self, addr: usize, len: usize) -> Result<MemoryView<'a>> {
        self.check(addr, len)?;
        Ok(MemoryView {
            base: addr,
            size: len,
            ..*self
        })
    }

    /// Maps an offset from the start of the view to an address that can be
    /// dereferenced directly. Only local views have such addresses.
    pub fn addr_of_offset(&self, offset: usize, len: usize) -> Result<usize> {
        if let Reader::Remote { .. } = self.reader {
            return Err(Error::NotMapped);
        }
        let addr = self.base.checked_add(offset).ok_or(Error::AddressOverflow)?;
        self.check(addr, len)?;
        Ok(addr)
    }

    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.check(addr, buf.len())?;
        match self.reader {
            Reader::Local => {
                let src = core::ptr::with_exposed_provenance::<u8>(addr);
                // SAFETY: the range was checked against the view, whose
                // constructor promised it is readable.
                unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
                Ok(())
            }
            Reader::Remote { pid } => read_remote(pid, addr, buf),
        }
    }

    pub fn read_array<const N: usize>(&self, addr: usize) -> Result<[u8; N]> {
        let mut buf = [0; N];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&self, addr: usize) -> Result<u8> {
        Ok(self.read_array::<1>(addr)?[0])
    }

    pub fn read_u16(&self, addr: usize) -> Result<u16> {
        self.read_array(addr).map(u16::from_ne_bytes)
    }

    pub fn read_u32(&self, addr: usize) -> Result<u32> {
        self.read_array(addr).map(u32::from_ne_bytes)
    }

    pub fn read_u64(&self, addr: usize) -> Result<u64> {
        self.read_array(addr).map(u64::from_ne_bytes)
    }

    pub fn read_usize(&self, addr: usize) -> Result<usize> {
        self.read_array(addr).map(usize::from_ne_bytes)
    }

    /// Reads a NUL-terminated string of at most `buf.len()` bytes and returns
    /// it without the terminator. A string that does not end within the buffer
    /// comes back truncated to the buffer length.
    pub fn read_cstring<'b>(&self, addr: usize, buf: &'b mut [u8]) -> Result<&'b [u8]> {
        for i in 0..buf.len() {
            let at = addr.checked_add(i).ok_or(Error::AddressOverflow)?;
            let byte = self.read_u8(at)?;
            if byte == 0 {
                return Ok(&buf[..i]);
            }
            buf[i] = byte;
        }
        Ok(buf)
    }
}

/// The caller-supplied stack window `[min, max)` of the thread being walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub min: usize,
    pub max: usize,
}

impl StackBounds {
    pub fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.min..self.max).contains(&addr)
    }

    /// Whether `len` bytes starting at `addr` all lie on the stack.
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        addr >= self.min && addr.checked_add(len).is_some_and(|end| end <= self.max)
    }

    /// A view over the stack, fetched through `reader`.
    ///
    /// # Safety
    /// For local readers the whole range must be mapped and readable, which
    /// holds for the stack of the thread being unwound.
    pub unsafe fn view(&self, reader: Reader) -> MemoryView<'static> {
        let size = self.max.saturating_sub(self.min);
        match reader {
            Reader::Local => MemoryView::local(self.min, size),
            Reader::Remote { pid } => MemoryView {
                base: self.min,
                size,
                reader: Reader::Remote { pid },
                _marker: PhantomData,
            },
        }
    }
}

const WORD: usize = size_of::<usize>();

fn peek(pid: libc::pid_t, addr: usize) -> Result<[u8; WORD]> {
    // PEEKDATA returns the word itself, so -1 is ambiguous until errno is
    // checked.
    stdext::clear_errno();
    // SAFETY: PEEKDATA only reads from the tracee; the last argument is unused.
    let word = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKDATA,
            pid,
            addr as *mut libc::c_void,
            core::ptr::null_mut::<libc::c_void>(),
        )
    };
    if word == -1 {
        let errno = stdext::errno();
        if errno != 0 {
            trace!(pid, addr, errno, "PTRACE_PEEKDATA failed");
            return Err(Error::ReadFailed { addr });
        }
    }
    Ok((word as usize).to_ne_bytes())
}

fn read_remote(pid: libc::pid_t, addr: usize, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;

    let misalign = addr % WORD;
    if misalign != 0 && !buf.is_empty() {
        let word = peek(pid, addr - misalign)?;
        let n = (WORD - misalign).min(buf.len());
        buf[..n].copy_from_slice(&word[misalign..misalign + n]);
        done = n;
    }

    while buf.len() - done >= WORD {
        let word = peek(pid, addr + done)?;
        buf[done..done + WORD].copy_from_slice(&word);
        done += WORD;
    }

    if done < buf.len() {
        let word = peek(pid, addr + done)?;
        let tail = buf.len() - done;
        buf[done..].copy_from_slice(&word[..tail]);
    }

    Ok(())
}
