// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Canonical, encoding-independent hashing of structured values.
//!
//! Values are lifted into an [`Ipld`] tree and hashed bottom-up. Every node is
//! hashed as `SHA-256(tag || body)`; map entries are sorted by their own
//! hashes, so the digest depends only on the logical value and never on how
//! it was serialized or in which order fields were inserted.

use std::collections::BTreeMap;

use libipld::Ipld;
use serde_json::Value;

use super::Entry;
use crate::merkle::{sha256, Hash};

const TAG_NULL: u8 = b'n';
const TAG_BOOL: u8 = b'b';
const TAG_INTEGER: u8 = b'i';
const TAG_FLOAT: u8 = b'f';
const TAG_STRING: u8 = b'u';
const TAG_BYTES: u8 = b'r';
const TAG_LIST: u8 = b'l';
const TAG_MAP: u8 = b'd';
const TAG_LINK: u8 = b'c';

/// Hashes an arbitrary IPLD value.
pub fn hash_ipld(value: &Ipld) -> Hash {
    match value {
        Ipld::Null => sha256(&[&[TAG_NULL]]),
        Ipld::Bool(flag) => sha256(&[&[TAG_BOOL], &[u8::from(*flag)]]),
        Ipld::Integer(number) => sha256(&[&[TAG_INTEGER], number.to_string().as_bytes()]),
        Ipld::Float(number) => {
            // -0.0 and 0.0 are the same number.
            let normalized = if *number == 0.0 { 0.0f64 } else { *number };
            sha256(&[&[TAG_FLOAT], &normalized.to_bits().to_be_bytes()])
        }
        Ipld::String(text) => sha256(&[&[TAG_STRING], text.as_bytes()]),
        Ipld::Bytes(bytes) => sha256(&[&[TAG_BYTES], bytes]),
        Ipld::List(items) => {
            let body: Vec<u8> = items.iter().flat_map(hash_ipld).collect();
            sha256(&[&[TAG_LIST], &body])
        }
        Ipld::Map(entries) => {
            let mut pairs: Vec<[u8; 64]> = entries
                .iter()
                .map(|(key, value)| {
                    let mut pair = [0u8; 64];
                    pair[..32].copy_from_slice(&hash_ipld(&Ipld::String(key.clone())));
                    pair[32..].copy_from_slice(&hash_ipld(value));
                    pair
                })
                .collect();
            pairs.sort_unstable();
            let body = pairs.concat();
            sha256(&[&[TAG_MAP], &body])
        }
        Ipld::Link(cid) => sha256(&[&[TAG_LINK], &cid.to_bytes()]),
    }
}

/// Lifts a JSON document into IPLD. Integral numbers become integers.
pub fn json_to_ipld(value: &Value) -> Ipld {
    match value {
        Value::Null => Ipld::Null,
        Value::Bool(flag) => Ipld::Bool(*flag),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Ipld::Integer(i128::from(int))
            } else if let Some(int) = number.as_u64() {
                Ipld::Integer(i128::from(int))
            } else {
                Ipld::Float(number.as_f64().unwrap_or_default())
            }
        }
        Value::String(text) => Ipld::String(text.clone()),
        Value::Array(items) => Ipld::List(items.iter().map(json_to_ipld).collect()),
        Value::Object(fields) => Ipld::Map(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), json_to_ipld(value)))
                .collect(),
        ),
    }
}

pub fn hash_json(value: &Value) -> Hash {
    hash_ipld(&json_to_ipld(value))
}

/// IPLD view of an entry. Empty optional fields are left out.
pub fn entry_to_ipld(entry: &Entry) -> Ipld {
    let mut fields = BTreeMap::new();
    fields.insert("index".to_owned(), Ipld::Bytes(entry.index.to_vec()));
    fields.insert("previous".to_owned(), Ipld::Bytes(entry.previous.to_vec()));
    if !entry.commitment.is_empty() {
        fields.insert(
            "commitment".to_owned(),
            Ipld::Bytes(entry.commitment.clone()),
        );
    }
    if !entry.authorized_keys.is_empty() {
        let keys = entry
            .authorized_keys
            .iter()
            .map(|key| Ipld::Bytes(key.bytes.clone()))
            .collect();
        fields.insert("authorized_keys".to_owned(), Ipld::List(keys));
    }
    if !entry.signatures.is_empty() {
        let signatures = entry
            .signatures
            .iter()
            .map(|(key_id, signature)| (key_id.clone(), Ipld::Bytes(signature.clone())))
            .collect();
        fields.insert("signatures".to_owned(), Ipld::Map(signatures));
    }
    Ipld::Map(fields)
}

/// Canonical hash of an entry, or of the null value when there is none.
pub fn hash_entry(entry: Option<&Entry>) -> Hash {
    match entry {
        Some(entry) => hash_ipld(&entry_to_ipld(entry)),
        None => hash_ipld(&Ipld::Null),
    }
}
