//! Tracee memory transfer.
//!
//! Transfers try the target's bulk primitive first and finish with word-granular
//! `PEEKDATA`/`POKEDATA`-style transfers. Addresses are masked to the tracee's pointer
//! width before use.

use std::cmp::min;

use nix::errno::Errno;
use tracing::trace;

use super::{Abi, Target};
use crate::error::{Error, Result};

/// A NUL-terminated string copied out of tracee memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteString {
    /// String contents, without the NUL terminator.
    pub bytes: Vec<u8>,

    /// `false` if the copy stopped before a terminator was seen.
    pub terminated: bool,
}

impl RemoteString {
    pub fn is_truncated(&self) -> bool {
        !self.terminated
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Mask `addr` to the pointer width of `abi`, if it is narrower than the tracer's.
pub fn mask_address(target: &dyn Target, abi: Abi, addr: u64) -> u64 {
    let width = abi.bitness().word_size();

    if width < target.word_size() {
        abi.bitness().truncate(addr)
    } else {
        addr
    }
}

pub fn read_word(target: &dyn Target, abi: Abi, addr: u64) -> Result<u64> {
    let addr = mask_address(target, abi, addr);

    target
        .read_word(addr)
        .map_err(|source| memory_error(target, addr, 0, source))
}

pub fn write_word(target: &mut dyn Target, abi: Abi, addr: u64, value: u64) -> Result<()> {
    let addr = mask_address(target, abi, addr);

    target
        .write_word(addr, value)
        .map_err(|source| memory_error(target, addr, 0, source))
}

/// Read tracee memory at `addr` into `buf`.
///
/// Returns the count of bytes read, which is short of `buf.len()` if the read faulted
/// part-way. Fails if no byte could be read.
pub fn read_memory(target: &dyn Target, abi: Abi, addr: u64, buf: &mut [u8]) -> Result<usize> {
    let addr = mask_address(target, abi, addr);

    if buf.is_empty() {
        return Ok(0);
    }

    let mut done = match target.read_bulk(addr, buf) {
        Ok(len) => len,
        Err(Errno::ESRCH) => return Err(memory_error(target, addr, 0, Errno::ESRCH)),
        Err(errno) => {
            trace!(pid = target.pid().as_raw(), %errno, "bulk read failed, reading words");
            0
        },
    };

    if done < buf.len() {
        let words = match addr.checked_add(done as u64) {
            Some(cur) => read_words(target, cur, &mut buf[done..]),
            None => Err((0, Errno::EFAULT)),
        };

        match words {
            Ok(len) => done += len,
            Err((len, source)) => {
                done += len;

                if done == 0 || source == Errno::ESRCH {
                    return Err(memory_error(target, addr, done, source));
                }
            },
        }
    }

    Ok(done)
}

/// Read exactly `len` bytes of tracee memory.
pub fn read_exact(target: &dyn Target, abi: Abi, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut data = vec![0; len];
    let done = read_memory(target, abi, addr, &mut data)?;

    if done < len {
        let addr = mask_address(target, abi, addr);
        return Err(Error::Memory { addr, transferred: done, source: Errno::EIO });
    }

    Ok(data)
}

/// Write `data` into tracee memory at `addr`.
///
/// Returns the count of bytes written. A count short of `data.len()` means the write
/// was torn. Fails if no byte could be written.
pub fn write_memory(target: &mut dyn Target, abi: Abi, addr: u64, data: &[u8]) -> Result<usize> {
    let addr = mask_address(target, abi, addr);

    if data.is_empty() {
        return Ok(0);
    }

    let mut done = match target.write_bulk(addr, data) {
        Ok(len) => len,
        Err(Errno::ESRCH) => return Err(memory_error(target, addr, 0, Errno::ESRCH)),
        Err(errno) => {
            trace!(pid = target.pid().as_raw(), %errno, "bulk write failed, writing words");
            0
        },
    };

    if done < data.len() {
        let words = match addr.checked_add(done as u64) {
            Some(cur) => write_words(target, cur, &data[done..]),
            None => Err((0, Errno::EFAULT)),
        };

        match words {
            Ok(len) => done += len,
            Err((len, source)) => {
                done += len;

                if done == 0 || source == Errno::ESRCH {
                    return Err(memory_error(target, addr, done, source));
                }
            },
        }
    }

    Ok(done)
}

/// Copy a NUL-terminated string of at most `max_len` bytes from tracee memory.
///
/// Fails if `addr` itself is unreadable, even when `max_len` is 0. A string longer than
/// `max_len`, or one which runs into unreadable memory or the end of the address space,
/// is returned truncated.
pub fn read_cstring(target: &dyn Target, abi: Abi, addr: u64, max_len: usize) -> Result<RemoteString> {
    let addr = mask_address(target, abi, addr);
    let word_size = target.word_size() as u64;

    if max_len == 0 {
        // Still fail on an unreadable `addr`.
        read_memory(target, abi, addr, &mut [0u8; 1])?;

        return Ok(RemoteString { bytes: vec![], terminated: false });
    }

    let mut bytes = Vec::with_capacity(min(max_len, 256));
    let mut chunk = [0u8; 8];

    while bytes.len() < max_len {
        let Some(cur) = addr.checked_add(bytes.len() as u64) else {
            break;
        };

        // Never cross a word boundary in one read, so a fault is only taken on the
        // word that actually contains unreadable bytes.
        let to_boundary = (word_size - cur % word_size) as usize;
        let len = min(to_boundary, max_len - bytes.len());

        let read = match read_memory(target, abi, cur, &mut chunk[..len]) {
            Ok(read) => read,
            Err(err) if bytes.is_empty() || err.tracee_died() => return Err(err),
            Err(_) => break,
        };

        if let Some(nul) = chunk[..read].iter().position(|&b| b == 0) {
            bytes.extend_from_slice(&chunk[..nul]);
            return Ok(RemoteString { bytes, terminated: true });
        }

        bytes.extend_from_slice(&chunk[..read]);

        if read < len {
            break;
        }
    }

    Ok(RemoteString { bytes, terminated: false })
}

/// Write `s` and a NUL terminator into tracee memory.
pub fn write_cstring(target: &mut dyn Target, abi: Abi, addr: u64, s: &[u8]) -> Result<usize> {
    let mut data = Vec::with_capacity(s.len() + 1);
    data.extend_from_slice(s);
    data.push(0);

    write_memory(target, abi, addr, &data)
}

/// Read a pointer-sized value, at the tracee's pointer width.
pub fn read_pointer(target: &dyn Target, abi: Abi, addr: u64) -> Result<u64> {
    let width = abi.bitness().word_size();
    let bytes = read_exact(target, abi, addr, width)?;
    let ptr = bytes_to_word(&bytes);

    Ok(mask_address(target, abi, ptr))
}

/// Decode member `index` of a NULL-terminated string array, such as `argv`.
///
/// Returns `None` at the terminating NULL pointer.
pub fn read_string_array_member(
    target: &dyn Target,
    abi: Abi,
    addr: u64,
    index: usize,
    max_len: usize,
) -> Result<Option<RemoteString>> {
    let width = abi.bitness().word_size() as u64;
    let slot = addr.wrapping_add(width.wrapping_mul(index as u64));
    let ptr = read_pointer(target, abi, slot)?;

    if ptr == 0 {
        return Ok(None);
    }

    read_cstring(target, abi, ptr, max_len).map(Some)
}

// Word-granular read. On failure, returns the count of bytes read before the fault.
fn read_words(target: &dyn Target, addr: u64, buf: &mut [u8]) -> std::result::Result<usize, (usize, Errno)> {
    let word_size = target.word_size();
    let mut done = 0;

    while done < buf.len() {
        let cur = addr.checked_add(done as u64).ok_or((done, Errno::EFAULT))?;
        let base = cur - cur % word_size as u64;
        let skip = (cur - base) as usize;
        let len = min(word_size - skip, buf.len() - done);

        let word = target.read_word(base).map_err(|errno| (done, errno))?;
        let bytes = word_to_bytes(word, word_size);

        buf[done..done + len].copy_from_slice(&bytes[skip..skip + len]);
        done += len;
    }

    Ok(done)
}

// Word-granular write. Partially-covered words at either end are read, spliced, and
// written back, so bytes outside `data` are preserved.
fn write_words(target: &mut dyn Target, addr: u64, data: &[u8]) -> std::result::Result<usize, (usize, Errno)> {
    let word_size = target.word_size();
    let mut done = 0;

    while done < data.len() {
        let cur = addr.checked_add(done as u64).ok_or((done, Errno::EFAULT))?;
        let base = cur - cur % word_size as u64;
        let skip = (cur - base) as usize;
        let len = min(word_size - skip, data.len() - done);

        let mut bytes = if skip == 0 && len == word_size {
            vec![0; word_size]
        } else {
            let word = target.read_word(base).map_err(|errno| (done, errno))?;
            word_to_bytes(word, word_size)
        };

        bytes[skip..skip + len].copy_from_slice(&data[done..done + len]);

        target
            .write_word(base, bytes_to_word(&bytes))
            .map_err(|errno| (done, errno))?;

        done += len;
    }

    Ok(done)
}

/// Native-endian bytes of the low `word_size` bytes of `word`.
pub(crate) fn word_to_bytes(word: u64, word_size: usize) -> Vec<u8> {
    match word_size {
        4 => (word as u32).to_ne_bytes().to_vec(),
        _ => word.to_ne_bytes().to_vec(),
    }
}

/// Inverse of `word_to_bytes()`. `bytes` must be 4 or 8 bytes long.
pub(crate) fn bytes_to_word(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];

    match bytes.len() {
        4 => {
            word[..4].copy_from_slice(bytes);
            u64::from(u32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
        },
        _ => {
            word.copy_from_slice(&bytes[..8]);
            u64::from_ne_bytes(word)
        },
    }
}

fn memory_error(target: &dyn Target, addr: u64, transferred: usize, source: Errno) -> Error {
    if source == Errno::ESRCH {
        return Error::TraceeDied { pid: target.pid(), source };
    }

    Error::Memory { addr, transferred, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::testing::FakeTarget;

    const BASE: u64 = 0x1000;

    fn target(bulk: bool) -> FakeTarget {
        let mut target = FakeTarget::new(8);
        if bulk {
            target = target.with_bulk();
        }
        target.map(BASE, &[0xaa; 32]);
        target
    }

    #[test]
    fn test_unaligned_write_preserves_neighbors() {
        for bulk in [false, true] {
            let mut target = target(bulk);

            let written = write_memory(&mut target, Abi::X86_64, BASE + 3, b"hello world").unwrap();

            assert_eq!(written, 11);
            assert_eq!(target.bytes(BASE, 3), vec![0xaa; 3]);
            assert_eq!(target.bytes(BASE + 3, 11), b"hello world".to_vec());
            assert_eq!(target.bytes(BASE + 14, 18), vec![0xaa; 18]);
        }
    }

    #[test]
    fn test_unaligned_read() {
        for bulk in [false, true] {
            let mut target = target(bulk);
            target.map(BASE + 5, b"abcdefghijk");

            let mut buf = [0u8; 11];
            let read = read_memory(&target, Abi::X86_64, BASE + 5, &mut buf).unwrap();

            assert_eq!(read, 11);
            assert_eq!(&buf, b"abcdefghijk");
        }
    }

    #[test]
    fn test_torn_write_reports_count() {
        let mut target = target(false);

        // Last mapped byte is `BASE + 31`.
        let written = write_memory(&mut target, Abi::X86_64, BASE + 28, &[1; 8]).unwrap();

        assert_eq!(written, 4);
        assert_eq!(target.bytes(BASE + 28, 4), vec![1; 4]);
    }

    #[test]
    fn test_unmapped_read_fails() {
        let target = target(false);
        let mut buf = [0u8; 4];

        let err = read_memory(&target, Abi::X86_64, 0x9000, &mut buf).unwrap_err();

        assert!(matches!(err, Error::Memory { transferred: 0, .. }));
    }

    #[test]
    fn test_cstring_truncation() {
        let mut target = target(false);
        target.map(BASE, b"abcdefghi\0");

        let s = read_cstring(&target, Abi::X86_64, BASE, 5).unwrap();

        assert_eq!(s.bytes, b"abcde".to_vec());
        assert!(s.is_truncated());
    }

    #[test]
    fn test_cstring_terminated() {
        let mut target = target(true);
        target.map(BASE + 1, b"/etc/passwd\0");

        let s = read_cstring(&target, Abi::X86_64, BASE + 1, 128).unwrap();

        assert_eq!(s.to_string_lossy(), "/etc/passwd");
        assert!(s.terminated);
    }

    #[test]
    fn test_cstring_unreadable() {
        let target = target(false);

        assert!(read_cstring(&target, Abi::X86_64, 0xdead_0000, 5).is_err());
    }

    #[test]
    fn test_cstring_runs_into_unmapped() {
        let mut target = FakeTarget::new(8);
        target.map(BASE, b"abcdefgh");

        let s = read_cstring(&target, Abi::X86_64, BASE, 64).unwrap();

        assert_eq!(s.bytes, b"abcdefgh".to_vec());
        assert!(s.is_truncated());
    }

    #[test]
    fn test_cstring_zero_len_checks_address() {
        let target = target(false);

        assert!(read_cstring(&target, Abi::X86_64, 0xdead_0000, 0).is_err());

        let s = read_cstring(&target, Abi::X86_64, BASE, 0).unwrap();
        assert!(s.bytes.is_empty());
        assert!(s.is_truncated());
    }

    #[test]
    fn test_transfer_stops_at_end_of_address_space() {
        let mut target = FakeTarget::new(8);
        target.map(u64::MAX - 7, &[0x11; 8]);

        let mut buf = [0u8; 8];
        let read = read_memory(&target, Abi::X86_64, u64::MAX - 2, &mut buf).unwrap();
        assert_eq!(read, 3);
        assert_eq!(&buf[..3], &[0x11; 3]);

        let written = write_memory(&mut target, Abi::X86_64, u64::MAX - 2, &[0x22; 8]).unwrap();
        assert_eq!(written, 3);
        assert_eq!(target.bytes(u64::MAX - 7, 8), [&[0x11u8; 5][..], &[0x22; 3][..]].concat());

        let s = read_cstring(&target, Abi::X86_64, u64::MAX - 2, 64).unwrap();
        assert_eq!(s.bytes, vec![0x22; 3]);
        assert!(s.is_truncated());
    }

    #[test]
    fn test_write_cstring() {
        let mut target = target(false);

        let written = write_cstring(&mut target, Abi::X86_64, BASE + 2, b"xyz").unwrap();

        assert_eq!(written, 4);
        assert_eq!(target.bytes(BASE + 2, 4), b"xyz\0".to_vec());
    }

    #[test]
    fn test_mask_address_for_narrow_abi() {
        let mut target = target(false);
        target.map(0x2000, b"ok\0\0\0\0\0\0");

        let s = read_cstring(&target, Abi::I386, 0xffff_ffff_0000_2000, 8).unwrap();
        assert_eq!(s.bytes, b"ok".to_vec());

        assert_eq!(mask_address(&target, Abi::X86_64, 0xffff_ffff_0000_2000), 0xffff_ffff_0000_2000);
    }

    #[test]
    fn test_string_array_member() {
        let mut target = FakeTarget::new(8);

        // 32-bit argv at 0x3000: { 0x3100, 0x3200, NULL }.
        let mut argv = vec![];
        for ptr in [0x3100u32, 0x3200, 0] {
            argv.extend_from_slice(&ptr.to_ne_bytes());
        }
        argv.extend_from_slice(&[0; 4]);
        target.map(0x3000, &argv);
        target.map(0x3100, b"ls\0\0\0\0\0\0");
        target.map(0x3200, b"-la\0\0\0\0\0");

        let arg0 = read_string_array_member(&target, Abi::I386, 0x3000, 0, 16).unwrap();
        let arg1 = read_string_array_member(&target, Abi::I386, 0x3000, 1, 16).unwrap();
        let end = read_string_array_member(&target, Abi::I386, 0x3000, 2, 16).unwrap();

        assert_eq!(arg0.unwrap().bytes, b"ls".to_vec());
        assert_eq!(arg1.unwrap().bytes, b"-la".to_vec());
        assert_eq!(end, None);
    }

    #[test]
    fn test_word_bytes_inverse() {
        assert_eq!(bytes_to_word(&word_to_bytes(0x1122_3344, 4)), 0x1122_3344);
        assert_eq!(bytes_to_word(&word_to_bytes(u64::MAX - 7, 8)), u64::MAX - 7);
    }
}
