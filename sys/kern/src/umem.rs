// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for interacting with unprivileged/user memory.

use core::marker::PhantomData;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A (user, untrusted, unprivileged) slice.
///
/// A `USlice` is passed into the kernel by a task, and is intended to
/// refer to memory that task controls -- a message to copy out, a buffer
/// for the kernel to deposit a reply into. The type itself represents an
/// _allegation_ from the task that a span of address space is suitable.
///
/// There is no memory protection on this platform, so the kernel does not
/// verify the allegation; a bad pointer produces a synchronous abort,
/// which is treated as a fatal diagnosis-offline condition rather than a
/// recoverable error. What the type does guarantee:
///
/// - The base is correctly aligned for `T`.
/// - The span does not wrap the end of the address space.
///
/// Access only happens through `assume_readable`/`assume_writable`, and
/// only while the owning task is blocked, so no two copies ever run on
/// the same buffer concurrently.
pub struct USlice<T> {
    /// Base address of the slice.
    base_address: usize,
    /// Number of `T` elements in the slice.
    length: usize,
    /// since we don't actually use T...
    _marker: PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Constructs a `USlice` from a base address and length passed from
    /// untrusted code.
    ///
    /// Fails if the base is unaligned for `T` or the slice would overlap
    /// the end of the address space. Zero-sized `T` is categorically
    /// rejected.
    pub fn from_raw(base_address: usize, length: usize) -> Result<Self, ()> {
        // NOTE: the properties checked here are what the rest of the
        // kernel relies on. Think carefully before loosening any of them,
        // or adding a second way to construct a USlice.
        uassert!(core::mem::size_of::<T>() != 0);

        if base_address % core::mem::align_of::<T>() != 0 {
            return Err(());
        }
        let size_in_bytes =
            length.checked_mul(core::mem::size_of::<T>()).ok_or(())?;
        // Note: this subtraction cannot underflow. You can subtract any
        // usize from usize::MAX.
        let highest_possible_base = usize::MAX - size_in_bytes;
        if base_address <= highest_possible_base {
            Ok(Self {
                base_address,
                length,
                _marker: PhantomData,
            })
        } else {
            Err(())
        }
    }

    /// Constructs an empty `USlice` with a well-aligned nonzero base, so
    /// it's safe to turn into an empty Rust slice.
    pub fn empty() -> Self {
        Self {
            base_address: core::ptr::NonNull::<T>::dangling().as_ptr() as usize,
            length: 0,
            _marker: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of `T`s in this slice.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn base_addr(&self) -> usize {
        self.base_address
    }
}

impl<T> USlice<T>
where
    T: FromBytes + Immutable + KnownLayout,
{
    /// Converts this into an _actual_ slice that can be directly read by
    /// the kernel.
    ///
    /// An empty `USlice` produces an empty slice without touching the
    /// base address, so callers can pass zero-length buffers (or null
    /// base/zero length pairs) and get a zero-byte transfer.
    ///
    /// # Safety
    ///
    /// This operation is unchecked. To use it safely you must convince
    /// yourself that the memory is real, readable on behalf of the task
    /// you're working for, and not aliased by any slice you intend to
    /// `&mut`-reference.
    pub unsafe fn assume_readable(&self) -> &[T] {
        if self.length == 0 {
            return &[];
        }
        // Safety: this function's contract ensures that the slice we
        // produce here is valid.
        unsafe {
            core::slice::from_raw_parts(
                self.base_address as *const T,
                self.length,
            )
        }
    }
}

impl<T> USlice<T>
where
    T: FromBytes + IntoBytes + KnownLayout,
{
    /// Converts this into an _actual_ slice that can be directly read and
    /// written by the kernel. As with `assume_readable`, an empty
    /// `USlice` yields an empty slice unconditionally.
    ///
    /// # Safety
    ///
    /// Same contract as `assume_readable`, plus exclusivity: nothing else
    /// may be reading or writing the span while the returned slice lives.
    pub unsafe fn assume_writable(&mut self) -> &mut [T] {
        if self.length == 0 {
            return &mut [];
        }
        // Safety: this function's contract ensures that the slice we
        // produce here is valid.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.base_address as *mut T,
                self.length,
            )
        }
    }
}

impl<T> Clone for USlice<T> {
    fn clone(&self) -> Self {
        Self {
            base_address: self.base_address,
            length: self.length,
            _marker: PhantomData,
        }
    }
}

/// Can't `derive(Debug)` for `USlice` because that puts a `Debug`
/// requirement on `T`, and that's silly.
impl<T> core::fmt::Debug for USlice<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("USlice")
            .field("base_address", &self.base_address)
            .field("length", &self.length)
            .finish()
    }
}

/// Copies `min(src.len(), dst.len())` bytes from `src` into `dst` and
/// returns the number copied. The truncation policy of the IPC engine
/// lives here: the *return value a caller reports* is chosen by the
/// caller, not by this routine.
///
/// # Safety
///
/// Both slices must refer to real memory owned by tasks that are blocked
/// (or the Active caller itself), and must not overlap. The zero-length
/// case is handled without touching either pointer, so empty slices from
/// arbitrary bases are fine.
pub unsafe fn copy_truncated(src: &USlice<u8>, dst: &mut USlice<u8>) -> usize {
    let n = usize::min(src.len(), dst.len());
    if n == 0 {
        return 0;
    }
    // Safety: per this function's contract.
    unsafe {
        let from = &src.assume_readable()[..n];
        let to = &mut dst.assume_writable()[..n];
        to.copy_from_slice(from);
    }
    n
}

/// Reads a NUL-terminated string from user memory into `buf`, returning
/// the initialized prefix. Stops at NUL, at the end of `buf`, or at a
/// non-UTF-8 byte sequence (lossy cutoff). The Klog and Panic syscalls
/// take C strings, so this is bounded by the caller's buffer rather than
/// by anything the user supplies.
///
/// # Safety
///
/// `addr` must point at readable memory containing a terminator within
/// `buf.len()` bytes, or at least `buf.len()` readable bytes.
pub unsafe fn read_cstr_bounded<'a>(
    addr: usize,
    buf: &'a mut [u8],
) -> &'a str {
    let mut n = 0;
    while n < buf.len() {
        // Safety: per this function's contract.
        let b = unsafe { core::ptr::read((addr + n) as *const u8) };
        if b == 0 {
            break;
        }
        buf[n] = b;
        n += 1;
    }
    match core::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(e) => {
            // Keep the valid prefix; the rest was garbage.
            let valid = e.valid_up_to();
            // Safety: valid_up_to marks a UTF-8 boundary.
            unsafe { core::str::from_utf8_unchecked(&buf[..valid]) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_rejects_misalignment() {
        assert!(USlice::<u32>::from_raw(0x1002, 1).is_err());
        assert!(USlice::<u32>::from_raw(0x1004, 1).is_ok());
        // u8 has no alignment to violate.
        assert!(USlice::<u8>::from_raw(0x1003, 1).is_ok());
    }

    #[test]
    fn from_raw_rejects_address_space_wrap() {
        assert!(USlice::<u8>::from_raw(usize::MAX, 1).is_err());
        assert!(USlice::<u8>::from_raw(usize::MAX - 4, 4).is_ok());
        assert!(USlice::<u32>::from_raw(8, usize::MAX / 2).is_err());
    }

    #[test]
    fn copy_is_truncated_to_shorter_side() {
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let mut dst = [0u8; 4];
        let s = USlice::from_raw(src.as_ptr() as usize, src.len()).unwrap();
        let mut d =
            USlice::from_raw(dst.as_mut_ptr() as usize, dst.len()).unwrap();
        let n = unsafe { copy_truncated(&s, &mut d) };
        assert_eq!(n, 4);
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn zero_length_copy_touches_nothing() {
        let src: [u8; 0] = [];
        let mut dst = [0xAAu8; 2];
        let s = USlice::from_raw(src.as_ptr() as usize, 0).unwrap();
        let mut d = USlice::from_raw(dst.as_mut_ptr() as usize, 2).unwrap();
        assert_eq!(unsafe { copy_truncated(&s, &mut d) }, 0);
        assert_eq!(dst, [0xAA, 0xAA]);

        // Empty destination likewise.
        let s2 = USlice::from_raw(dst.as_ptr() as usize, 2).unwrap();
        let mut d2 = USlice::<u8>::empty();
        assert_eq!(unsafe { copy_truncated(&s2, &mut d2) }, 0);
    }

    #[test]
    fn cstr_read_stops_at_nul_and_cap() {
        let msg = b"hello\0world";
        let mut buf = [0u8; 32];
        let s = unsafe { read_cstr_bounded(msg.as_ptr() as usize, &mut buf) };
        assert_eq!(s, "hello");

        let long = b"abcdefgh"; // no NUL inside the cap
        let mut small = [0u8; 4];
        let s =
            unsafe { read_cstr_bounded(long.as_ptr() as usize, &mut small) };
        assert_eq!(s, "abcd");
    }
}
