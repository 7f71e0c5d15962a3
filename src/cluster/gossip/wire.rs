//! Encrypted gossip frames
//!
//! ```text
//! u32 BE    length of the sealed body
//! 12 bytes  random nonce
//! rest      ChaCha20-Poly1305 ciphertext of bincode Frame { protocol_version, message }
//! ```

use crate::{Error, Result};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the pre-shared key
pub const SECRET_LEN: usize = 32;

/// Largest sealed body accepted from a peer
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A member as advertised during push-pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub name: String,
    pub addr: SocketAddr,
    pub heartbeat: u64,
    pub left: bool,
    pub meta: Vec<u8>,
}

/// Gossip message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Full member table exchange, answered with the receiver's table
    PushPull {
        join: bool,
        members: Vec<Digest>,
        state: Vec<u8>,
        broadcasts: Vec<Vec<u8>>,
    },
    /// Application payload, answered with [`Message::Ack`]
    User(Vec<u8>),
    Ack,
}

#[derive(Serialize, Deserialize)]
struct Frame<M> {
    protocol_version: u8,
    message: M,
}

/// Seals and opens frames under the shared secret
pub struct FrameCodec {
    cipher: ChaCha20Poly1305,
    protocol_version: u8,
}

impl FrameCodec {
    pub fn new(secret: &[u8], protocol_version: u8) -> Result<Self> {
        if secret.len() != SECRET_LEN {
            return Err(Error::Config(format!(
                "gossip secret must be {} bytes, got {}",
                SECRET_LEN,
                secret.len()
            )));
        }
        let cipher = ChaCha20Poly1305::new_from_slice(secret)
            .map_err(|e| Error::Config(format!("invalid gossip secret: {}", e)))?;
        Ok(Self {
            cipher,
            protocol_version,
        })
    }

    /// Encrypt `message` into a frame body (nonce + ciphertext)
    pub fn seal(&self, message: &Message) -> Result<Vec<u8>> {
        let plaintext = bincode::serialize(&Frame {
            protocol_version: self.protocol_version,
            message,
        })?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| Error::Transport("unable to encrypt gossip frame".to_string()))?;

        let mut body = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        body.extend_from_slice(&nonce);
        body.extend_from_slice(&ciphertext);
        Ok(body)
    }

    /// Authenticate and decode a frame body
    pub fn open(&self, body: &[u8]) -> Result<Message> {
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Transport(format!(
                "gossip frame too short: {} bytes",
                body.len()
            )));
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Transport("gossip frame failed authentication".to_string()))?;

        let frame: Frame<Message> = bincode::deserialize(&plaintext)?;
        if frame.protocol_version != self.protocol_version {
            return Err(Error::Transport(format!(
                "incompatible peer protocol version {} (local {})",
                frame.protocol_version, self.protocol_version
            )));
        }
        Ok(frame.message)
    }

    pub async fn write<W>(&self, writer: &mut W, message: &Message) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let body = self.seal(message)?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(Error::Transport(format!(
                "gossip frame of {} bytes exceeds limit",
                body.len()
            )));
        }
        writer.write_u32(body.len() as u32).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read<R>(&self, reader: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_BYTES {
            return Err(Error::Transport(format!(
                "peer announced a {} byte frame",
                len
            )));
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        self.open(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(data: &[u8]) -> Message {
        Message::User(data.to_vec())
    }

    #[test]
    fn test_secret_must_be_32_bytes() {
        assert!(FrameCodec::new(&[7u8; 16], 1).is_err());
        assert!(FrameCodec::new(&[7u8; 33], 1).is_err());
        assert!(FrameCodec::new(&[7u8; SECRET_LEN], 1).is_ok());
    }

    #[test]
    fn test_sealed_frames_use_fresh_nonces() {
        let codec = FrameCodec::new(&[1u8; SECRET_LEN], 1).unwrap();
        let a = codec.seal(&user(b"payload")).unwrap();
        let b = codec.seal(&user(b"payload")).unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.open(&a).unwrap(), user(b"payload"));
        assert_eq!(codec.open(&b).unwrap(), user(b"payload"));
    }

    #[test]
    fn test_wrong_secret_fails_authentication() {
        let sender = FrameCodec::new(&[1u8; SECRET_LEN], 1).unwrap();
        let receiver = FrameCodec::new(&[2u8; SECRET_LEN], 1).unwrap();

        let body = sender.seal(&Message::Ack).unwrap();
        let err = receiver.open(&body).unwrap_err();
        assert!(format!("{}", err).contains("authentication"));
    }

    #[test]
    fn test_tampered_frame_is_rejected() {
        let codec = FrameCodec::new(&[1u8; SECRET_LEN], 1).unwrap();
        let mut body = codec.seal(&user(b"payload")).unwrap();
        let last = body.len() - 1;
        body[last] ^= 0x01;
        assert!(codec.open(&body).is_err());
    }

    #[test]
    fn test_protocol_version_mismatch_is_rejected() {
        let old = FrameCodec::new(&[1u8; SECRET_LEN], 1).unwrap();
        let new = FrameCodec::new(&[1u8; SECRET_LEN], 2).unwrap();

        let body = old.seal(&Message::Ack).unwrap();
        let err = new.open(&body).unwrap_err();
        assert!(format!("{}", err).contains("incompatible"));
    }

    #[tokio::test]
    async fn test_frames_over_a_stream() {
        let codec = FrameCodec::new(&[9u8; SECRET_LEN], 1).unwrap();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let sent = Message::PushPull {
            join: true,
            members: vec![Digest {
                name: "node-a".to_string(),
                addr: "127.0.0.1:7946".parse().unwrap(),
                heartbeat: 42,
                left: false,
                meta: Vec::new(),
            }],
            state: Vec::new(),
            broadcasts: vec![b"hello".to_vec()],
        };
        codec.write(&mut client, &sent).await.unwrap();
        codec.write(&mut client, &Message::Ack).await.unwrap();

        assert_eq!(codec.read(&mut server).await.unwrap(), sent);
        assert_eq!(codec.read(&mut server).await.unwrap(), Message::Ack);
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let codec = FrameCodec::new(&[9u8; SECRET_LEN], 1).unwrap();
        let (mut client, mut server) = tokio::io::duplex(1024);

        client
            .write_u32((MAX_FRAME_BYTES + 1) as u32)
            .await
            .unwrap();
        let err = codec.read(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
