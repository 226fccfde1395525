use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Mirrored-page deques round capacity to page multiples.
const BUF_SIZE_INCREMENT: usize = 4096;

/// A fixed-capacity buffered FIFO byte queue backed by a mirrored
/// mapping, so both the data and the free space are always available
/// as single contiguous slices. Data is appended at the tail and
/// consumed from the head.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "Buffer size must be divisible by {}, got {}",
                BUF_SIZE_INCREMENT, size
            );
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Consume bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Commit bytes previously written into `write_slice`.
    #[inline]
    pub fn commit(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Mutable view of the buffered data (in-place rewrites, e.g.
    /// chunked decoding).
    #[inline]
    pub fn data_slice(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    /// Drop a tail portion of the buffered data (after an in-place
    /// rewrite shrank it).
    #[inline]
    pub fn truncate_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(-(count as isize)) }
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Slice of free capacity to be written, then committed.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        let free = self.free_capacity();
        unsafe { &mut self.data.tail_head_slice()[..free] }
    }

    /// Append bytes, up to free capacity. Returns the number appended.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.free_capacity());
        self.write_slice()[..count].copy_from_slice(&bytes[..count]);
        self.commit(count);
        count
    }

    /// Write buffered data to the supplied writer, consuming what was
    /// accepted. Stops on WouldBlock; WouldBlock with zero progress is
    /// returned as an error so the caller can park the stream.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => self.consume(count),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let written = orig_len - self.data.len();
                    if written > 0 && err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(written);
                    }
                    return Err(err);
                }
            }
        }

        Ok(orig_len - self.data.len())
    }

    /// Read from the supplied reader until WouldBlock, EOF or the
    /// buffer fills up. Returns bytes read plus an EOF flag.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, bool)> {
        let orig_len = self.data.len();

        while self.data.len() < self.size {
            let free = self.size - self.data.len();
            let read_count = unsafe {
                match reader.read(&mut self.data.tail_head_slice()[..free]) {
                    Ok(count) => count,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let received = self.data.len() - orig_len;
                        if err.kind() == io::ErrorKind::WouldBlock {
                            return Ok((received, false));
                        }
                        return Err(err);
                    }
                }
            };

            if read_count == 0 {
                return Ok((self.data.len() - orig_len, true));
            }

            self.commit(read_count);
        }

        Ok((self.data.len() - orig_len, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        pub fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT / 2).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let (received, eof) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(received, mock_data.len());
        assert!(!eof);
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        let data = [1u8, 2, 3];
        let (received, eof) = buffer.ingress(&data[..]).unwrap();
        assert_eq!(received, 3);
        assert!(eof);
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_ingress_stops_when_full() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT * 2).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data, 999, 0);

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let (received, eof) = buffer.ingress(&mut channel).unwrap();
        assert_eq!(received, BUF_SIZE_INCREMENT);
        assert!(!eof);
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.append(&[1]);

        let result = buffer.egress(&mut zero_vec[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_egress_partial_progress_is_ok() {
        let mut channel = MockChannel::new(Vec::new(), 2, 2);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.append(&[1, 2, 3, 4]);

        let count = buffer.egress(&mut channel).unwrap();
        assert_eq!(count, 2);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_inplace_rewrite() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.append(b"abcdef");
        let data = buffer.data_slice();
        data.copy_within(3..6, 0);
        buffer.truncate_tail(3);
        assert_eq!(buffer.read_slice(), b"def");
    }

    #[test]
    #[should_panic(expected = "Buffer size must be divisible by 4096, got 1000")]
    fn test_fail_on_incorrect_increment() {
        let _ = Buffer::new(1000);
    }
}
