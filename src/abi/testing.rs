//! In-memory [`Target`] for exercising backends without a live tracee.

use std::collections::BTreeMap;

use nix::errno::Errno;

use super::Target;
use crate::ptracer::Pid;

#[derive(Clone, Debug)]
pub(crate) struct FakeTarget {
    pub pid: Pid,
    pub word_size: usize,
    pub user: BTreeMap<u64, u64>,
    pub memory: BTreeMap<u64, u8>,
    pub bulk: bool,
    pub syscall_register: Option<u64>,
    pub user_writes: usize,
}

impl FakeTarget {
    pub fn new(word_size: usize) -> Self {
        Self {
            pid: Pid::from_raw(4242),
            word_size,
            user: BTreeMap::new(),
            memory: BTreeMap::new(),
            bulk: false,
            syscall_register: None,
            user_writes: 0,
        }
    }

    pub fn with_bulk(mut self) -> Self {
        self.bulk = true;
        self
    }

    pub fn set_user(&mut self, offset: u64, value: u64) {
        self.user.insert(offset, value);
    }

    pub fn user(&self, offset: u64) -> u64 {
        self.user.get(&offset).copied().unwrap_or(0)
    }

    /// Map `bytes` at `addr`.
    pub fn map(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *b);
        }
    }

    pub fn bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64).map(|i| self.memory[&(addr + i)]).collect()
    }

    fn word_bytes(&self, addr: u64) -> nix::Result<Vec<u8>> {
        (0..self.word_size as u64)
            .map(|i| self.memory.get(&(addr + i)).copied().ok_or(Errno::EIO))
            .collect()
    }
}

impl Target for FakeTarget {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn word_size(&self) -> usize {
        self.word_size
    }

    fn read_user(&self, offset: u64) -> nix::Result<u64> {
        Ok(self.user(offset))
    }

    fn write_user(&mut self, offset: u64, value: u64) -> nix::Result<()> {
        self.user_writes += 1;
        self.user.insert(offset, value);
        Ok(())
    }

    fn read_word(&self, addr: u64) -> nix::Result<u64> {
        let bytes = self.word_bytes(addr)?;
        Ok(super::memory::bytes_to_word(&bytes))
    }

    fn write_word(&mut self, addr: u64, value: u64) -> nix::Result<()> {
        // Fail without side effects if any byte of the word is unmapped.
        self.word_bytes(addr)?;

        let bytes = super::memory::word_to_bytes(value, self.word_size);
        self.map(addr, &bytes);

        Ok(())
    }

    fn read_bulk(&self, addr: u64, buf: &mut [u8]) -> nix::Result<usize> {
        if !self.bulk {
            return Err(Errno::ENOSYS);
        }

        let mut n = 0;
        for (i, b) in buf.iter_mut().enumerate() {
            match self.memory.get(&(addr + i as u64)) {
                Some(v) => *b = *v,
                None => break,
            }
            n += 1;
        }

        if n == 0 {
            return Err(Errno::EIO);
        }

        Ok(n)
    }

    fn write_bulk(&mut self, addr: u64, data: &[u8]) -> nix::Result<usize> {
        if !self.bulk {
            return Err(Errno::ENOSYS);
        }

        let n = (0..data.len() as u64)
            .take_while(|i| self.memory.contains_key(&(addr + i)))
            .count();

        if n == 0 {
            return Err(Errno::EIO);
        }

        self.map(addr, &data[..n]);

        Ok(n)
    }

    fn write_syscall_register(&mut self, nr: u64) -> nix::Result<()> {
        self.syscall_register = Some(nr);
        Ok(())
    }
}
