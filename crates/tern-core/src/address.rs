//! Address encoding.
//!
//! An address commits to a 32-byte BLAKE3 key hash and may carry an opaque,
//! encrypted derivation payload that lets the owning wallet recover the
//! `(account, chain, index)` path the address was generated from. Only the
//! holder of the root key can read the payload; to everyone else it is noise.
//!
//! # Binary layout
//! ```text
//! kind (1) || network (1) || key_hash (32) || payload_len (1) || payload || checksum (4)
//! ```
//! The checksum is the first four bytes of BLAKE3 over everything before it.
//! The text form is Base58 of the whole byte string.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::constants::MAX_ADDRESS_PAYLOAD;
use crate::crypto::PublicKey;
use crate::error::AddressError;
use crate::types::Hash256;

const CHECKSUM_LEN: usize = 4;

/// Fixed part of the binary layout (kind, network, key hash, payload length).
const HEADER_LEN: usize = 1 + 1 + 32 + 1;

/// Network identifier encoded in every address.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
}

impl Network {
    fn tag(self) -> u8 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, AddressError> {
        match tag {
            0 => Ok(Network::Mainnet),
            1 => Ok(Network::Testnet),
            other => Err(AddressError::UnknownNetwork(other)),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

/// What an address may be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressKind {
    /// Ordinary spendable address.
    Standard,
    /// Redemption address. Funds can only be redeemed from it, never sent to it.
    Redeem,
}

impl AddressKind {
    fn tag(self) -> u8 {
        match self {
            AddressKind::Standard => 0,
            AddressKind::Redeem => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, AddressError> {
        match tag {
            0 => Ok(AddressKind::Standard),
            2 => Ok(AddressKind::Redeem),
            other => Err(AddressError::UnknownKind(other)),
        }
    }
}

/// A wallet address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    network: Network,
    kind: AddressKind,
    key_hash: Hash256,
    payload: Option<Vec<u8>>,
}

impl Address {
    /// Standard address for a key hash, without a derivation payload.
    pub fn from_key_hash(key_hash: Hash256, network: Network) -> Self {
        Self {
            network,
            kind: AddressKind::Standard,
            key_hash,
            payload: None,
        }
    }

    /// Standard address for a public key, without a derivation payload.
    pub fn from_public_key(public_key: &PublicKey, network: Network) -> Self {
        Self::from_key_hash(public_key.key_hash(), network)
    }

    /// Redemption address for a key hash.
    pub fn redeem(key_hash: Hash256, network: Network) -> Self {
        Self {
            kind: AddressKind::Redeem,
            ..Self::from_key_hash(key_hash, network)
        }
    }

    /// Attach an encrypted derivation payload. An empty payload encodes the
    /// same as none and is stored as none.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Result<Self, AddressError> {
        if payload.len() > MAX_ADDRESS_PAYLOAD {
            return Err(AddressError::PayloadTooLarge(payload.len()));
        }
        self.payload = (!payload.is_empty()).then_some(payload);
        Ok(self)
    }

    pub fn key_hash(&self) -> Hash256 {
        self.key_hash
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Whether this is a redemption-only address.
    pub fn is_redeem(&self) -> bool {
        self.kind == AddressKind::Redeem
    }

    /// The encrypted derivation payload, if the address carries one.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Binary form without the checksum.
    fn body_bytes(&self) -> Vec<u8> {
        let payload = self.payload.as_deref().unwrap_or_default();
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
        out.push(self.kind.tag());
        out.push(self.network.tag());
        out.extend_from_slice(self.key_hash.as_bytes());
        // with_payload bounds the length well below u8::MAX
        out.push(payload.len() as u8);
        out.extend_from_slice(payload);
        out
    }

    /// Full binary form including the checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.body_bytes();
        let checksum = checksum(&out);
        out.extend_from_slice(&checksum);
        out
    }

    /// Parse the binary form produced by [`Address::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let (body, check) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if checksum(body) != check {
            return Err(AddressError::InvalidChecksum);
        }

        let kind = AddressKind::from_tag(body[0])?;
        let network = Network::from_tag(body[1])?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&body[2..34]);
        let payload_len = body[34] as usize;
        let payload = &body[HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        if payload_len > MAX_ADDRESS_PAYLOAD {
            return Err(AddressError::PayloadTooLarge(payload_len));
        }

        Ok(Self {
            network,
            kind,
            key_hash: Hash256(hash),
            payload: (payload_len > 0).then(|| payload.to_vec()),
        })
    }

    /// Encode as a Base58 string.
    pub fn encode(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }

    /// Decode a Base58 address string.
    pub fn decode(s: &str) -> Result<Self, AddressError> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|_| AddressError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = blake3::hash(body);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    out
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl bincode::Encode for Address {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.to_bytes(), encoder)
    }
}

impl<Context> bincode::Decode<Context> for Address {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        let bytes: Vec<u8> = bincode::Decode::decode(decoder)?;
        Self::from_bytes(&bytes)
            .map_err(|e| bincode::error::DecodeError::OtherString(e.to_string()))
    }
}

bincode::impl_borrow_decode!(Address);
