//! Encrypted stream halves wrapping a transport connection.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use ctr::cipher::StreamCipher;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::session::SessionCipher;

/// Read half of an authenticated session: bytes are deciphered with the
/// session keystream as they arrive.
pub struct SecureReader<R> {
    inner: R,
    cipher: SessionCipher,
}

impl<R> SecureReader<R> {
    pub fn new(inner: R, cipher: SessionCipher) -> Self {
        SecureReader { inner, cipher }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SecureReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        // Decipher exactly the bytes this poll produced; the keystream
        // position stays aligned with the stream position.
        let filled = buf.filled_mut();
        this.cipher.apply_keystream(&mut filled[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Write half of an authenticated session.
pub struct SecureWriter<W> {
    inner: W,
    cipher: SessionCipher,
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    pub fn new(inner: W, cipher: SessionCipher) -> Self {
        SecureWriter { inner, cipher }
    }

    /// Encipher and write one full frame.
    pub async fn write_frame(&mut self, data: &[u8]) -> std::io::Result<()> {
        let mut buf = data.to_vec();
        self.cipher.apply_keystream(&mut buf);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await
    }
}
