//! Runtime load address of the executable.
//!
//! External symbolizers work on addresses as they appear in the binary on
//! disk, so a raw return address must be related to where the loader actually
//! placed the image.  The base address is the link-time address of the code
//! segment plus the slide applied by the loader (ASLR).

use crate::error::LeakError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBase {
    /// Virtual address of the executable code segment, as linked.
    pub link_address: usize,
    /// Offset added by the loader.
    pub slide: usize,
}

impl ImageBase {
    pub fn base(&self) -> usize {
        self.link_address.wrapping_add(self.slide)
    }

    /// Address as the binary on disk sees it.
    pub fn file_address(&self, addr: usize) -> usize {
        addr.wrapping_sub(self.slide)
    }
}

/// Locate the current executable among the loaded images.
pub fn resolve() -> Result<ImageBase, LeakError> {
    let link_address = imp::link_time_text_address()?;
    let exe = std::env::current_exe().map_err(LeakError::ExecutablePath)?;
    let slide = imp::image_slide(&exe)?;
    Ok(ImageBase { link_address, slide })
}

#[cfg(target_os = "linux")]
mod imp {
    use std::{
        ffi::{CStr, OsStr},
        os::unix::ffi::OsStrExt,
        path::Path,
    };

    use libc::{c_int, c_void, dl_phdr_info, size_t};

    use crate::error::LeakError;

    #[cfg(target_pointer_width = "64")]
    type Phdr = libc::Elf64_Phdr;
    #[cfg(target_pointer_width = "32")]
    type Phdr = libc::Elf32_Phdr;

    const PT_LOAD: u32 = 1;
    const PF_X: u32 = 1;

    /// `p_vaddr` of the first executable `PT_LOAD` segment, read from the program
    /// headers the kernel mapped for the main executable.
    pub(super) fn link_time_text_address() -> Result<usize, LeakError> {
        let (phdr, phnum) = unsafe {
            (
                libc::getauxval(libc::AT_PHDR) as *const Phdr,
                libc::getauxval(libc::AT_PHNUM) as usize,
            )
        };
        if phdr.is_null() {
            return Err(LeakError::NoCodeSegment);
        }
        let headers = unsafe { std::slice::from_raw_parts(phdr, phnum) };
        headers
            .iter()
            .find(|h| h.p_type == PT_LOAD && h.p_flags & PF_X != 0)
            .map(|h| h.p_vaddr as usize)
            .ok_or(LeakError::NoCodeSegment)
    }

    struct Search<'a> {
        exe: &'a Path,
        slide: Option<usize>,
    }

    unsafe extern "C" fn visit(info: *mut dl_phdr_info, _size: size_t, data: *mut c_void) -> c_int {
        let search = &mut *(data as *mut Search<'_>);
        let info = &*info;
        let name: &[u8] = if info.dlpi_name.is_null() {
            b""
        } else {
            CStr::from_ptr(info.dlpi_name).to_bytes()
        };
        // glibc reports the main program with an empty name.
        if name.is_empty() || Path::new(OsStr::from_bytes(name)) == search.exe {
            search.slide = Some(info.dlpi_addr as usize);
            return 1;
        }
        0
    }

    pub(super) fn image_slide(exe: &Path) -> Result<usize, LeakError> {
        let mut search = Search { exe, slide: None };
        unsafe {
            libc::dl_iterate_phdr(Some(visit), &mut search as *mut Search<'_> as *mut c_void);
        }
        search
            .slide
            .ok_or_else(|| LeakError::ImageNotFound(exe.to_path_buf()))
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::path::Path;

    use crate::error::LeakError;

    pub(super) fn link_time_text_address() -> Result<usize, LeakError> {
        Err(LeakError::Unsupported)
    }

    pub(super) fn image_slide(_exe: &Path) -> Result<usize, LeakError> {
        Err(LeakError::Unsupported)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn base_is_link_address_plus_slide() {
        let image = resolve().unwrap();
        assert_eq!(image.base(), image.link_address.wrapping_add(image.slide));
        assert_eq!(image.file_address(image.base()), image.link_address);
    }

    #[test]
    fn own_code_lies_above_the_base() {
        let image = resolve().unwrap();
        let here = base_is_link_address_plus_slide as usize;
        assert!(here >= image.base());
    }

    #[test]
    fn main_program_is_found_by_path() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(imp::image_slide(&exe).unwrap(), resolve().unwrap().slide);
    }
}
