use aead::{AeadInPlace, KeyInit, Nonce};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use crate::key_exchange::{KeyMaterial, Role};

/// bit in a datagram's version byte that marks the rest of the datagram as encrypted
pub const ENCRYPTED_MARK: u8 = 0x80;
pub const VERSION_MASK: u8 = 0x7f;

const TAG_LEN: usize = 16;
const COUNTER_LEN: usize = size_of::<u64>();

/// Encryption of whole datagrams ('package mode').
///
/// An encrypted datagram has the following structure:
///
/// ```ascii
///  0: protocol version | 0x80 (u8) - transmitted unencrypted to allow versioning of encryption
///  1: nonce counter (u64)
///  9: encrypted payload (the full ARQ header and body, plus 16 bytes AES-GCM 'tag')
/// ```
///
/// The version byte is authenticated as associated data.
pub trait ArqEncryption: Send + Sync {
    fn is_encrypting(&self) -> bool;

    /// number of bytes a datagram grows by, including the version byte
    fn envelope_overhead(&self) -> usize;

    fn seal(&self, protocol_version: u8, plaintext: &[u8]) -> anyhow::Result<Bytes>;
}

pub struct NoEncryption;
impl ArqEncryption for NoEncryption {
    fn is_encrypting(&self) -> bool {
        false
    }

    fn envelope_overhead(&self) -> usize {
        1 // protocol version
    }

    fn seal(&self, protocol_version: u8, plaintext: &[u8]) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(plaintext.len() + 1);
        buf.put_u8(protocol_version & VERSION_MASK);
        buf.put_slice(plaintext);
        Ok(buf.freeze())
    }
}

/// splits a received datagram into its version and whether the rest is encrypted
pub fn envelope_version(datagram: &[u8]) -> Option<(u8, bool)> {
    datagram.first()
        .map(|&b| (b & VERSION_MASK, b & ENCRYPTED_MARK != 0))
}

/// AES-GCM with a 128 bit or 256 bit key ('reinforced')
enum GcmCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl GcmCipher {
    fn new(key: &[u8]) -> anyhow::Result<GcmCipher> {
        match key.len() {
            16 => Ok(GcmCipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(|e| anyhow!("{}", e))?)),
            32 => Ok(GcmCipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("{}", e))?)),
            n => bail!("unsupported AES key length {}", n),
        }
    }

    fn encrypt(&self, nonce: &[u8; 12], aad: &[u8], buf: &mut BytesMut) -> anyhow::Result<()> {
        let nonce = Nonce::<Aes256Gcm>::from_slice(nonce);
        let result = match self {
            GcmCipher::Aes128(cipher) => cipher.encrypt_in_place(nonce, aad, buf),
            GcmCipher::Aes256(cipher) => cipher.encrypt_in_place(nonce, aad, buf),
        };
        result.map_err(|_| anyhow!("error encrypting buffer"))
    }

    fn decrypt(&self, nonce: &[u8; 12], aad: &[u8], buf: &mut BytesMut) -> anyhow::Result<()> {
        let nonce = Nonce::<Aes256Gcm>::from_slice(nonce);
        let result = match self {
            GcmCipher::Aes128(cipher) => cipher.decrypt_in_place(nonce, aad, buf),
            GcmCipher::Aes256(cipher) => cipher.decrypt_in_place(nonce, aad, buf),
        };
        result.map_err(|_| anyhow!("decryption error"))
    }
}

/// Both peers share the same key, so nonces are separated by the sender's role: the IV is
///  XOR'ed with the role in its first byte and a per-sender counter in its last eight bytes.
struct NonceSequence {
    iv: [u8; 12],
    own_role: Role,
    counter: AtomicU64,
}

impl NonceSequence {
    fn new(iv: [u8; 12], own_role: Role) -> NonceSequence {
        NonceSequence {
            iv,
            own_role,
            counter: AtomicU64::new(0),
        }
    }

    fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel)
    }

    fn nonce(&self, role: Role, counter: u64) -> [u8; 12] {
        let mut nonce = self.iv;
        nonce[0] ^= role.nonce_marker();
        for (n, c) in nonce[4..].iter_mut().zip(counter.to_be_bytes()) {
            *n ^= c;
        }
        nonce
    }

    fn own_nonce(&self, counter: u64) -> [u8; 12] {
        self.nonce(self.own_role, counter)
    }

    fn peer_nonce(&self, counter: u64) -> [u8; 12] {
        self.nonce(self.own_role.peer(), counter)
    }
}

pub struct PackageEncryption {
    cipher: GcmCipher,
    nonces: NonceSequence,
}

impl PackageEncryption {
    pub fn new(keys: &KeyMaterial, own_role: Role) -> anyhow::Result<PackageEncryption> {
        Ok(PackageEncryption {
            cipher: GcmCipher::new(&keys.key)?,
            nonces: NonceSequence::new(keys.iv, own_role),
        })
    }

    /// decrypts a full datagram (including the version byte) that was sealed by the peer
    pub fn open(&self, datagram: &[u8]) -> anyhow::Result<Bytes> {
        if datagram.len() < 1 + COUNTER_LEN + TAG_LEN {
            bail!("received buffer too short");
        }
        let version_byte = datagram[0];
        if version_byte & ENCRYPTED_MARK == 0 {
            bail!("datagram is not encrypted");
        }
        let mut rest = &datagram[1..];
        let counter = rest.get_u64();
        let mut buf = BytesMut::from(rest);

        self.cipher.decrypt(&self.nonces.peer_nonce(counter), &[version_byte], &mut buf)?;
        Ok(buf.freeze())
    }
}

impl ArqEncryption for PackageEncryption {
    fn is_encrypting(&self) -> bool {
        true
    }

    fn envelope_overhead(&self) -> usize {
        1               // protocol version
            + COUNTER_LEN
            + TAG_LEN
    }

    fn seal(&self, protocol_version: u8, plaintext: &[u8]) -> anyhow::Result<Bytes> {
        let version_byte = (protocol_version & VERSION_MASK) | ENCRYPTED_MARK;
        let counter = self.nonces.next_counter();

        let mut body = BytesMut::with_capacity(plaintext.len() + TAG_LEN);
        body.put_slice(plaintext);
        self.cipher.encrypt(&self.nonces.own_nonce(counter), &[version_byte], &mut body)?;

        let mut buf = BytesMut::with_capacity(1 + COUNTER_LEN + body.len());
        buf.put_u8(version_byte);
        buf.put_u64(counter);
        buf.put_slice(&body);
        trace!("sealed datagram with counter {}", counter);
        Ok(buf.freeze())
    }
}

/// Encryption of application data ('data mode'), applied to each logical data package before it
///  is segmented, so resent segments are byte-identical.
///
/// ```ascii
/// 0: nonce counter (u64)
/// 8: ciphertext plus 16 bytes AES-GCM tag
/// ```
pub struct DataEncryption {
    cipher: GcmCipher,
    nonces: NonceSequence,
}

impl DataEncryption {
    pub const OVERHEAD: usize = COUNTER_LEN + TAG_LEN;

    pub fn new(keys: &KeyMaterial, own_role: Role) -> anyhow::Result<DataEncryption> {
        Ok(DataEncryption {
            cipher: GcmCipher::new(&keys.key)?,
            nonces: NonceSequence::new(keys.iv, own_role),
        })
    }

    pub fn seal(&self, plaintext: &[u8]) -> anyhow::Result<Bytes> {
        let counter = self.nonces.next_counter();
        let mut body = BytesMut::with_capacity(plaintext.len() + TAG_LEN);
        body.put_slice(plaintext);
        self.cipher.encrypt(&self.nonces.own_nonce(counter), b"", &mut body)?;

        let mut buf = BytesMut::with_capacity(COUNTER_LEN + body.len());
        buf.put_u64(counter);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    pub fn open(&self, mut buf: Bytes) -> anyhow::Result<Bytes> {
        if buf.len() < Self::OVERHEAD {
            bail!("encrypted data package too short");
        }
        let counter = buf.get_u64();
        let mut body = BytesMut::from(buf.as_ref());
        self.cipher.decrypt(&self.nonces.peer_nonce(counter), b"", &mut body)?;
        Ok(body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn keys(key_len: usize) -> KeyMaterial {
        KeyMaterial {
            key: (0..key_len).map(|i| i as u8).collect(),
            iv: [7; 12],
        }
    }

    #[test]
    fn test_no_encryption() {
        let sealed = NoEncryption.seal(2, &[1, 2, 3]).unwrap();
        assert_eq!(sealed.as_ref(), &[2, 1, 2, 3]);
        assert_eq!(envelope_version(&sealed), Some((2, false)));
        assert_eq!(NoEncryption.envelope_overhead(), 1);
    }

    #[rstest]
    #[case::aes128(16)]
    #[case::aes256(32)]
    fn test_package_encryption(#[case] key_len: usize) {
        let initiator = PackageEncryption::new(&keys(key_len), Role::Initiator).unwrap();
        let responder = PackageEncryption::new(&keys(key_len), Role::Responder).unwrap();

        let sealed = initiator.seal(2, &[1, 2, 3, 4]).unwrap();
        assert_eq!(sealed.len(), 4 + initiator.envelope_overhead());
        assert_eq!(envelope_version(&sealed), Some((2, true)));

        assert_eq!(responder.open(&sealed).unwrap().as_ref(), &[1, 2, 3, 4]);
        // a sender can not decrypt its own datagrams since nonces are separated by role
        assert!(initiator.open(&sealed).is_err());

        let reply = responder.seal(2, &[9]).unwrap();
        assert_eq!(initiator.open(&reply).unwrap().as_ref(), &[9]);
    }

    #[test]
    fn test_package_encryption_unique_nonces() {
        let initiator = PackageEncryption::new(&keys(16), Role::Initiator).unwrap();
        let a = initiator.seal(2, &[1, 2, 3]).unwrap();
        let b = initiator.seal(2, &[1, 2, 3]).unwrap();
        assert_ne!(a, b);
    }

    #[rstest]
    #[case::tampered_body(20)]
    #[case::tampered_counter(3)]
    #[case::tampered_version(0)]
    fn test_package_encryption_tampered(#[case] offset: usize) {
        let initiator = PackageEncryption::new(&keys(32), Role::Initiator).unwrap();
        let responder = PackageEncryption::new(&keys(32), Role::Responder).unwrap();

        let mut sealed = initiator.seal(2, &[1, 2, 3, 4]).unwrap().to_vec();
        sealed[offset] ^= 1;
        assert!(responder.open(&sealed).is_err());
    }

    #[test]
    fn test_package_encryption_wrong_key() {
        let initiator = PackageEncryption::new(&keys(32), Role::Initiator).unwrap();
        let other = PackageEncryption::new(&KeyMaterial { key: vec![1; 32], iv: [7; 12] }, Role::Responder).unwrap();
        let sealed = initiator.seal(2, &[1, 2, 3, 4]).unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_package_encryption_short_or_plain() {
        let responder = PackageEncryption::new(&keys(16), Role::Responder).unwrap();
        assert!(responder.open(&[0x82, 1, 2]).is_err());
        assert!(responder.open(&[2; 40]).is_err());
    }

    #[test]
    fn test_unsupported_key_length() {
        assert!(PackageEncryption::new(&keys(24), Role::Initiator).is_err());
        assert!(DataEncryption::new(&keys(0), Role::Initiator).is_err());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short(vec![1, 2, 3])]
    #[case::long(vec![5; 3000])]
    fn test_data_encryption(#[case] plaintext: Vec<u8>) {
        let initiator = DataEncryption::new(&keys(32), Role::Initiator).unwrap();
        let responder = DataEncryption::new(&keys(32), Role::Responder).unwrap();

        let sealed = initiator.seal(&plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + DataEncryption::OVERHEAD);
        assert_eq!(responder.open(sealed.clone()).unwrap().as_ref(), plaintext.as_slice());
        assert!(initiator.open(sealed).is_err());
    }
}
