//! Native stack protection for the recursive traversal
//! - Depth counter per thread; nothing is checked for shallow graphs
//! - Every `STACKCHECK_STRIDE` levels the stack pointer is compared against the
//!   thread's low stack boundary (OS-reported bounds plus a safety margin)
//! - Platforms without stack introspection fall back to a plain depth limit

use std::cell::Cell;
use std::marker::PhantomData;

use crate::error::{CloneError, CloneResult};
use crate::ffi;

const STACKCHECK_STRIDE: u32 = 16;
/// Headroom kept below the check point; debug builds use much larger frames.
const STACK_SAFETY_MARGIN: usize = 512 * 1024;
const FALLBACK_DEPTH_CEILING: u32 = 10_000;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
    /// `None` until probed; `Some(None)` when the platform could not tell us.
    static STACK_LOW: Cell<Option<Option<usize>>> = const { Cell::new(None) };
}

/// RAII depth token; dropping it leaves one level.
#[must_use]
pub struct DepthGuard {
    _not_send: PhantomData<*const ()>,
}

impl DepthGuard {
    #[inline(always)]
    pub fn enter() -> CloneResult<Self> {
        let depth = DEPTH.with(|d| {
            let depth = d.get() + 1;
            d.set(depth);
            depth
        });

        if depth >= STACKCHECK_STRIDE && depth % STACKCHECK_STRIDE == 0 {
            if let Err(err) = check_headroom(depth) {
                DEPTH.with(|d| d.set(depth - 1));
                return Err(err);
            }
        }
        Ok(Self {
            _not_send: PhantomData,
        })
    }
}

impl Drop for DepthGuard {
    #[inline(always)]
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cold]
#[inline(never)]
fn check_headroom(depth: u32) -> CloneResult<()> {
    match stack_low() {
        Some(low) => {
            let probe = 0u8;
            let sp = std::ptr::addr_of!(probe) as usize;
            if sp <= low {
                return Err(CloneError::RecursionExceeded { depth });
            }
        }
        None => {
            let limit = unsafe { ffi::Py_GetRecursionLimit() }.max(0) as u32;
            if depth > limit.min(FALLBACK_DEPTH_CEILING) {
                return Err(CloneError::RecursionExceeded { depth });
            }
        }
    }
    Ok(())
}

fn stack_low() -> Option<usize> {
    STACK_LOW.with(|cached| {
        if let Some(low) = cached.get() {
            return low;
        }
        let low = stack_bounds().map(|(low, size)| {
            if size > STACK_SAFETY_MARGIN {
                low + STACK_SAFETY_MARGIN
            } else {
                low
            }
        });
        if low.is_none() {
            log::debug!("stack bounds unavailable; using depth limit");
        }
        cached.set(Some(low));
        low
    })
}

/// `(lowest address, size)` of the current thread's stack.
#[cfg(target_os = "linux")]
fn stack_bounds() -> Option<(usize, usize)> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        (rc == 0 && !addr.is_null() && size != 0).then_some((addr as usize, size))
    }
}

#[cfg(target_os = "macos")]
fn stack_bounds() -> Option<(usize, usize)> {
    unsafe {
        let thread = libc::pthread_self();
        let size = libc::pthread_get_stacksize_np(thread);
        let high = libc::pthread_get_stackaddr_np(thread) as usize;
        (size != 0 && high > size).then_some((high - size, size))
    }
}

#[cfg(windows)]
fn stack_bounds() -> Option<(usize, usize)> {
    use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

    type GetStackLimits = unsafe extern "system" fn(*mut usize, *mut usize);

    let kernel32: Vec<u16> = "kernel32.dll".encode_utf16().chain(Some(0)).collect();
    unsafe {
        let module = GetModuleHandleW(kernel32.as_ptr());
        if module.is_null() {
            return None;
        }
        let proc = GetProcAddress(module, b"GetCurrentThreadStackLimits\0".as_ptr())?;
        let get_limits: GetStackLimits = std::mem::transmute(proc);
        let (mut low, mut high) = (0usize, 0usize);
        get_limits(&mut low, &mut high);
        (high > low).then_some((low, high - low))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn stack_bounds() -> Option<(usize, usize)> {
    None
}
