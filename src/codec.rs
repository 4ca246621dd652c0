//! Chunked wire codec: 4-byte length envelope around optionally
//! Snappy-compressed, optionally AES-CBC-encrypted payloads.
//!
//! Compression runs before encryption on the way out. When neither is
//! enabled the codec is a transparent passthrough with no envelope, so a
//! plain tunnel stays byte-for-byte identical to its source.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::MAX_CHUNK;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::Bytes;
use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const AES_BLOCK: usize = 16;

/// Codec errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("chunk length {0} out of range")]
    ChunkLength(u32),
    #[error("ciphertext is not block-aligned or padding is invalid")]
    BadPadding,
    #[error("decompression rejected the payload: {0}")]
    Decompress(#[from] snap::Error),
}

/// Per-stream codec parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecSpec {
    /// AES-128 key; `None` disables encryption.
    pub key: Option<[u8; 16]>,
    pub compress: bool,
}

impl CodecSpec {
    #[must_use]
    pub fn new(crypt: bool, compress: bool, verify_key: &str) -> Self {
        Self {
            key: crypt.then(|| derive_key(verify_key)),
            compress,
        }
    }

    /// Whether the codec is a raw passthrough.
    #[must_use]
    pub const fn is_plain(&self) -> bool {
        self.key.is_none() && !self.compress
    }
}

/// Derive the AES key for a client from its verify key.
#[must_use]
pub fn derive_key(verify_key: &str) -> [u8; 16] {
    Md5::digest(verify_key.as_bytes()).into()
}

/// Process one payload outbound: compress, then encrypt. Datagram paths
/// use this directly; streams go through [`ChunkWriter`].
pub fn seal(spec: &CodecSpec, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut payload;
    if spec.compress {
        payload = snap::raw::Encoder::new().compress_vec(data)?;
    } else {
        payload = data.to_vec();
    }
    if let Some(key) = &spec.key {
        payload = encrypt(key, &payload);
    }
    Ok(payload)
}

/// Inverse of [`seal`]: decrypt, then decompress.
pub fn open(spec: &CodecSpec, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut payload = data.to_vec();
    if let Some(key) = &spec.key {
        payload = decrypt(key, &payload)?;
    }
    if spec.compress {
        payload = snap::raw::Decoder::new().decompress_vec(&payload)?;
    }
    Ok(payload)
}

/// The IV is the key's first cipher block, kept for on-wire compatibility
/// with existing peers.
fn encrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), key.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}

fn decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.is_empty() || data.len() % AES_BLOCK != 0 {
        return Err(Error::BadPadding);
    }
    Aes128CbcDec::new(key.into(), key.into())
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| Error::BadPadding)
}

/// Reading half of a coded stream.
#[derive(Debug)]
pub struct ChunkReader<R> {
    rd: R,
    spec: CodecSpec,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(rd: R, spec: CodecSpec) -> Self {
        Self {
            rd,
            spec,
            buf: vec![0_u8; crate::config::BUFFER_SIZE],
        }
    }

    /// Read one chunk. `None` is EOF. In plain mode a chunk is whatever one
    /// transport read yields; in coded mode it is one decoded envelope.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if self.spec.is_plain() {
            let n = self.rd.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            return Ok(Some(Bytes::copy_from_slice(&self.buf[..n])));
        }
        let mut len_buf = [0_u8; 4];
        // EOF is only clean on an envelope boundary.
        let n = self.rd.read(&mut len_buf[..1]).await?;
        if n == 0 {
            return Ok(None);
        }
        self.rd.read_exact(&mut len_buf[1..]).await?;
        let len = u32::from_be_bytes(len_buf);
        if len == 0 || len > MAX_CHUNK {
            return Err(Error::ChunkLength(len));
        }
        let mut payload = vec![0_u8; len as usize];
        self.rd.read_exact(&mut payload).await?;
        Ok(Some(Bytes::from(open(&self.spec, &payload)?)))
    }
}

/// Writing half of a coded stream.
#[derive(Debug)]
pub struct ChunkWriter<W> {
    wr: W,
    spec: CodecSpec,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub fn new(wr: W, spec: CodecSpec) -> Self {
        Self { wr, spec }
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        if self.spec.is_plain() {
            self.wr.write_all(data).await?;
            self.wr.flush().await?;
            return Ok(());
        }
        let payload = seal(&self.spec, data)?;
        self.wr
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.wr.write_all(&payload).await?;
        self.wr.flush().await?;
        Ok(())
    }

    /// Propagate EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.wr.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypt_roundtrip() {
        let key = derive_key("abc123def0");
        for len in [1_usize, 15, 16, 17, 255, 4096] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let ct = encrypt(&key, &data);
            assert_eq!(ct.len() % AES_BLOCK, 0);
            assert_ne!(ct, data);
            assert_eq!(decrypt(&key, &ct).unwrap(), data);
        }
    }

    #[test]
    fn decrypt_rejects_mangled_padding() {
        let key = derive_key("abc123def0");
        let mut ct = encrypt(&key, b"hello world");
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(decrypt(&key, &ct).is_err());
        assert!(decrypt(&key, &ct[..ct.len() - 1]).is_err());
        assert!(decrypt(&key, &[]).is_err());
    }

    async fn roundtrip_spec(spec: CodecSpec) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (_, wr) = tokio::io::split(a);
        let (rd, _) = tokio::io::split(b);
        let mut writer = ChunkWriter::new(wr, spec);
        let mut reader = ChunkReader::new(rd, spec);
        let chunks: Vec<Vec<u8>> = vec![
            b"hello\n".to_vec(),
            vec![0_u8; 10_000],
            (0..=255_u8).cycle().take(70_000).collect(),
        ];
        for chunk in &chunks {
            writer.write_chunk(chunk).await.unwrap();
        }
        writer.shutdown().await.unwrap();
        let mut got = Vec::new();
        while let Some(chunk) = reader.read_chunk().await.unwrap() {
            got.extend_from_slice(&chunk);
        }
        let want: Vec<u8> = chunks.concat();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn coded_stream_roundtrip() {
        let key = "abc123def0";
        roundtrip_spec(CodecSpec::new(true, true, key)).await;
        roundtrip_spec(CodecSpec::new(true, false, key)).await;
        roundtrip_spec(CodecSpec::new(false, true, key)).await;
        roundtrip_spec(CodecSpec::new(false, false, key)).await;
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (a, b) = tokio::io::duplex(64);
        let (_, mut wr) = tokio::io::split(a);
        let (rd, _) = tokio::io::split(b);
        let spec = CodecSpec::new(true, false, "abc123def0");
        let mut reader = ChunkReader::new(rd, spec);
        tokio::io::AsyncWriteExt::write_all(&mut wr, &(MAX_CHUNK + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            reader.read_chunk().await,
            Err(Error::ChunkLength(_))
        ));
    }
}
