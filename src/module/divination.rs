//! # divination
//!
//! the practice of seeking knowledge of the future or the unknown by
//! supernatural means.
//!
//! we ask supernatural means (the dynamic linker) for knowledge of the future
//! (where we will find the dwarves)
//!
//! the dynamic linker knows every object it loaded into this process, where it
//! put it, and where its `PT_GNU_EH_FRAME` segment ended up. we let it list
//! them all with
//! [`dl_iterate_phdr`](https://man7.org/linux/man-pages/man3/dl_iterate_phdr.3.html)
//! and read their unwind data right where it is mapped, no files involved.

use core::ffi::{self, CStr};

use super::ModuleTable;
use crate::elf::ModuleImage;
use crate::{stdext, Result, PATH_CAPACITY};

struct Divination<'t> {
    table: &'t mut ModuleTable,
    result: Result<()>,
}

pub(super) fn loaded_objects(table: &mut ModuleTable) -> Result<()> {
    let mut divination = Divination {
        table,
        result: Ok(()),
    };
    // SAFETY: the callback only runs during this call and gets the pointer we
    // pass, which stays valid until we return.
    unsafe {
        libc::dl_iterate_phdr(
            Some(visit),
            (&raw mut divination).cast::<ffi::c_void>(),
        )
    };
    divination.result
}

unsafe extern "C" fn visit(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut ffi::c_void,
) -> ffi::c_int {
    // SAFETY: data is the Divination we passed to dl_iterate_phdr.
    let divination = unsafe { &mut *data.cast::<Divination<'_>>() };
    // SAFETY: the dynamic linker hands us a valid info for the duration of
    // the callback.
    let info = unsafe { &*info };

    // SAFETY: dlpi_phdr points to dlpi_phnum headers.
    let phdrs = unsafe { core::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) };
    let load_bias = info.dlpi_addr as usize;

    let mut exe_name = [0; PATH_CAPACITY];
    let name = if info.dlpi_name.is_null() {
        ""
    } else {
        // SAFETY: non-null dlpi_name is a C string.
        unsafe { CStr::from_ptr(info.dlpi_name) }.to_str().unwrap_or("")
    };
    // the main program comes without a name
    let name = if name.is_empty() { current_exe(&mut exe_name) } else { name };

    for ph in phdrs {
        if ph.p_type != libc::PT_LOAD || ph.p_flags & libc::PF_X == 0 {
            continue;
        }
        let start = load_bias.wrapping_add(ph.p_vaddr as usize);
        let end = start.wrapping_add(ph.p_memsz as usize);

        // SAFETY: the object stays loaded as long as nobody dlcloses it, which
        // is the caller's business.
        let image = match unsafe { ModuleImage::from_loaded_object(load_bias, phdrs) } {
            Ok(image) => Some(image),
            Err(err) => {
                debug!(name, ?err, "loaded object has no usable unwind data");
                None
            }
        };
        trace!(name, start, end, load_bias, "found loaded object");

        if let Err(err) = divination.table.push_image(start, end, load_bias, name, image) {
            divination.result = Err(err);
            return 1;
        }
    }
    0
}

fn current_exe(buf: &mut [u8; PATH_CAPACITY]) -> &str {
    // SAFETY: the buffer length is passed correctly.
    let len = unsafe { libc::readlink(c"/proc/self/exe".as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
    if len < 0 {
        stdext::with_last_os_error_str(|err| debug!("readlink /proc/self/exe failed: {err}"));
        return "";
    }
    let bytes = &buf[..len as usize];
    match core::str::from_utf8(bytes) {
        Ok(name) => name,
        Err(err) => {
            // keep what is valid, the name is only informational
            let valid = &bytes[..err.valid_up_to()];
            core::str::from_utf8(valid).unwrap_or("")
        }
    }
}
