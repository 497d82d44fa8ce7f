use std::fs::File;
use std::io::{self, ErrorKind, Result};

/// Positional I/O over a shared file handle. Reads and writes never move a
/// shared cursor, so any number of readers may proceed while the writer task
/// appends.
pub trait FileExt: Send + Sync + 'static {
    fn len(&self) -> io::Result<u64>;

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut written = 0;

        while written != buf.len() {
            written += self.write_at(&buf[written..], offset + written as u64)?;
        }

        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut read = 0;

        while read != buf.len() {
            let n = self.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "unexpected end-of-file",
                ));
            }
            read += n;
        }

        Ok(())
    }

    /// Flush file data (not necessarily metadata) to the device.
    fn sync_data(&self) -> Result<()>;
}

impl FileExt for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(nix::sys::uio::pwrite(self, buf, offset as _)?)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = nix::sys::uio::pread(self, buf, offset as _)?;
        Ok(n)
    }

    fn sync_data(&self) -> Result<()> {
        File::sync_data(self)
    }
}
