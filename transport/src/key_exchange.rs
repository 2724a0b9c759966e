use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

pub const CURVE_X25519: &str = "x25519";

const PUBLIC_KEY_LEN: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn peer(&self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub(crate) fn nonce_marker(&self) -> u8 {
        match self {
            Role::Initiator => 0x00,
            Role::Responder => 0x80,
        }
    }
}

/// symmetric key material derived from an ECDH shared secret
#[derive(Clone, Eq, PartialEq)]
pub struct KeyMaterial {
    pub key: Vec<u8>,
    pub iv: [u8; 12],
}

impl KeyMaterial {
    /// key: SHA-256 of the shared secret, truncated to 16 bytes unless `reinforce` is set.
    /// IV: SHA-256 of key and shared secret, truncated to 12 bytes
    pub fn derive(shared_secret: &[u8], reinforce: bool) -> KeyMaterial {
        let digest = Sha256::digest(shared_secret);
        let key_len = if reinforce { 32 } else { 16 };
        let key = digest[..key_len].to_vec();

        let mut hasher = Sha256::new();
        hasher.update(&key);
        hasher.update(shared_secret);
        let iv_digest = hasher.finalize();
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_digest[..12]);

        KeyMaterial { key, iv }
    }
}

/// One side's contribution to a key exchange: a (fresh) public key plus whether the derived key
///  should be 256 bit rather than 128 bit
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeySpec {
    pub reinforce: bool,
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

impl KeySpec {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.reinforce as u8);
        buf.put_u8(PUBLIC_KEY_LEN as u8);
        buf.put_slice(&self.public_key);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<KeySpec> {
        let reinforce = buf.try_get_u8()? != 0;
        let key_len: usize = buf.try_get_u8()?.into();
        if key_len != PUBLIC_KEY_LEN {
            bail!("unsupported public key length {}", key_len);
        }
        if buf.remaining() < key_len {
            bail!("incomplete public key");
        }
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        buf.copy_to_slice(&mut public_key);
        Ok(KeySpec { reinforce, public_key })
    }
}

/// payload of an ECDH section: the key for package encryption and optionally a separate key for
///  data encryption
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EcdhHandshake {
    pub package: KeySpec,
    pub data: Option<KeySpec>,
}

impl EcdhHandshake {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.package.ser(&mut buf);
        if let Some(data) = &self.data {
            data.ser(&mut buf);
        }
        buf.freeze()
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<EcdhHandshake> {
        let package = KeySpec::deser(&mut buf)?;
        let data = if buf.has_remaining() {
            Some(KeySpec::deser(&mut buf)?)
        }
        else {
            None
        };
        if buf.has_remaining() {
            bail!("trailing bytes after ECDH handshake");
        }
        Ok(EcdhHandshake { package, data })
    }
}

fn parse_public_key(raw: &[u8]) -> anyhow::Result<PublicKey> {
    let Ok(bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(raw) else {
        bail!("X25519 public keys have {} bytes, got {}", PUBLIC_KEY_LEN, raw.len());
    };
    Ok(PublicKey::from(bytes))
}

fn agree(secret: &StaticSecret, peer_public_key: &PublicKey) -> anyhow::Result<[u8; 32]> {
    let shared = secret.diffie_hellman(peer_public_key);
    if !shared.was_contributory() {
        bail!("peer public key is a low order point");
    }
    Ok(*shared.as_bytes())
}

pub fn public_key_for(private_key: &[u8; 32]) -> [u8; PUBLIC_KEY_LEN] {
    PublicKey::from(&StaticSecret::from(*private_key)).to_bytes()
}

/// Creates a fresh key pair, and derives key material against the peer's (well known) public
///  key. Returns the key spec to send to the peer along with the key material.
pub fn initiate(curve: &str, peer_public_key: &[u8], reinforce: bool) -> anyhow::Result<(KeySpec, KeyMaterial)> {
    if curve != CURVE_X25519 {
        bail!("unsupported curve '{}'", curve);
    }
    let peer_public_key = parse_public_key(peer_public_key)?;

    let secret = StaticSecret::from(rand::random::<[u8; 32]>());
    let shared = agree(&secret, &peer_public_key)?;

    let spec = KeySpec {
        reinforce,
        public_key: PublicKey::from(&secret).to_bytes(),
    };
    Ok((spec, KeyMaterial::derive(&shared, reinforce)))
}

/// the responder's side of `initiate`
pub fn respond(private_key: &[u8; 32], spec: &KeySpec) -> anyhow::Result<KeyMaterial> {
    let secret = StaticSecret::from(*private_key);
    let shared = agree(&secret, &PublicKey::from(spec.public_key))?;
    Ok(KeyMaterial::derive(&shared, spec.reinforce))
}
