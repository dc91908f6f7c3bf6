/// A random-access byte store holding a whole disk image.
///
/// Every method takes `&mut self` because implementations are free to share a
/// single cursor between reads and writes. Callers serialize access.
pub trait Storage {
    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Reading past the end of the store returns an `UnexpectedEof` error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes all of `buf` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Writing past the capacity of the store returns an error.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered IO to stable storage. Called at the end of every
    /// mutating operation.
    fn sync_disk(&mut self) -> std::io::Result<()>;
    /// Current length of the store in bytes.
    fn len(&mut self) -> std::io::Result<u64>;
    /// True when the store holds no bytes at all, i.e. was never formatted.
    fn is_empty(&mut self) -> std::io::Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or zero-extends the store.
    fn set_len(&mut self, len: u64) -> std::io::Result<()>;
}
