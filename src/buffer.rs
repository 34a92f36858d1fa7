//! A growable byte ring used for both the read and write side of a
//! `TcpConnection`. Modeled on the classic prepend-space/readable/writable
//! three-region buffer (`voyager`'s `Buffer`, itself modeled on muduo's):
//! bytes consumed from the front just move a read index rather than
//! memmove-ing the whole backing store, and the store only compacts when
//! it actually needs the room back.

use std::io;
use std::io::IoSliceMut;

const INITIAL_CAPACITY: usize = 1024;
/// Size of the on-stack scratch buffer `read_from` also fills via `readv`,
/// so a single syscall can absorb more than the ring currently has free
/// tail space for.
pub const EXTRA_BUFFER_SIZE: usize = 65536;

#[derive(Debug)]
pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            storage: vec![0; INITIAL_CAPACITY],
            read_index: 0,
            write_index: 0,
        }
    }

    pub fn readable(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    pub fn readable_len(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    /// Advances the read index, dropping `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.readable_len());
        self.read_index += n;
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        }
    }

    pub fn consume_all(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    fn writable_tail(&self) -> usize {
        self.storage.len() - self.write_index
    }

    /// Makes room for `len` more bytes, compacting (shifting readable bytes
    /// to the front) before growing the backing store if compaction alone
    /// would suffice.
    fn ensure_writable(&mut self, len: usize) {
        if self.writable_tail() >= len {
            return;
        }

        if self.read_index + self.writable_tail() >= len {
            let readable = self.readable_len();
            self.storage.copy_within(self.read_index..self.write_index, 0);
            self.read_index = 0;
            self.write_index = readable;
            return;
        }

        let needed = len - self.writable_tail();
        self.storage.resize(self.storage.len() + needed, 0);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Reads once from `source` (typically the connection's socket) into
    /// the buffer's free tail plus a 64 KiB stack scratch area, absorbing
    /// the scratch into the buffer if the read spilled into it. Returns the
    /// number of bytes read, same convention as `Read::read` (0 == EOF).
    pub fn read_from(&mut self, source: &impl Fn(&mut [IoSliceMut<'_>]) -> io::Result<usize>) -> io::Result<usize> {
        self.ensure_writable(1);
        let mut extra = [0u8; EXTRA_BUFFER_SIZE];
        let tail_start = self.write_index;

        let n = {
            let mut slices = [
                IoSliceMut::new(&mut self.storage[tail_start..]),
                IoSliceMut::new(&mut extra),
            ];
            source(&mut slices)?
        };

        let tail_capacity = self.storage.len() - tail_start;
        if n <= tail_capacity {
            self.write_index += n;
        } else {
            self.write_index = self.storage.len();
            let spilled = n - tail_capacity;
            self.append(&extra[..spilled]);
        }

        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_consume_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable(), b"hello");
        buf.consume(3);
        assert_eq!(buf.readable(), b"lo");
        buf.consume(2);
        assert!(buf.is_empty());
    }

    #[test]
    fn growth_beyond_initial_capacity() {
        let mut buf = Buffer::new();
        let chunk = vec![7u8; INITIAL_CAPACITY];
        buf.append(&chunk);
        buf.append(&chunk);
        assert_eq!(buf.readable_len(), INITIAL_CAPACITY * 2);
    }

    #[test]
    fn compaction_reclaims_consumed_front_space() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; INITIAL_CAPACITY - 10]);
        buf.consume(INITIAL_CAPACITY - 10);
        // Front is now free; appending should compact rather than grow.
        buf.append(&vec![2u8; INITIAL_CAPACITY - 10]);
        assert_eq!(buf.readable_len(), INITIAL_CAPACITY - 10);
    }

    #[test]
    fn read_from_uses_extra_buffer_when_tail_is_small() {
        let mut buf = Buffer::new();
        buf.append(&vec![0u8; INITIAL_CAPACITY - 4]);
        buf.consume(INITIAL_CAPACITY - 4);
        // Now read/write indices are both 0 (fully drained), full capacity free.
        assert_eq!(buf.readable_len(), 0);

        let payload = vec![9u8; INITIAL_CAPACITY + 100];
        let n = buf
            .read_from(&|slices: &mut [IoSliceMut<'_>]| {
                let mut written = 0;
                for slice in slices.iter_mut() {
                    let take = (payload.len() - written).min(slice.len());
                    slice[..take].copy_from_slice(&payload[written..written + take]);
                    written += take;
                    if written == payload.len() {
                        break;
                    }
                }
                Ok(written)
            })
            .unwrap();

        assert_eq!(n, payload.len());
        assert_eq!(buf.readable_len(), payload.len());
        assert_eq!(buf.readable(), &payload[..]);
    }
}
