use crate::error::Error;
use crate::net::TcpStream;

use super::splitter::Line;

/// Write-all wrapper over [`TcpStream::write_some`].
pub struct ByteWriter<'a> {
    socket: &'a TcpStream,
}

impl<'a> ByteWriter<'a> {
    pub fn new(socket: &'a TcpStream) -> Self {
        ByteWriter { socket }
    }

    /// Write every byte of `data`, looping over partial writes. A peer
    /// that goes away mid-write surfaces as [`Error::Disconnected`];
    /// partial progress is not reported.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let n = self.socket.write_some(data).await?;
            if n == 0 {
                return Err(Error::Disconnected { code: None });
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Write a [`Line`], both parts in order.
    pub async fn write_line(&self, line: Line<'_>) -> Result<(), Error> {
        self.write_all(line.part1).await?;
        self.write_all(line.part2).await
    }
}
