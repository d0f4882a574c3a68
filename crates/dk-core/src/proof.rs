//! Handshake proof sent by a backend as the first bytes of a tunnel.
//!
//! Format: `[16-byte nonce][first 16 bytes of HMAC-SHA256(secret, "dk-v1" || nonce || name)]`

use rand::RngCore;
use ring::hmac;
use std::collections::HashMap;

pub const NONCE_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const PROOF_LEN: usize = NONCE_LEN + TAG_LEN;

const DOMAIN: &[u8] = b"dk-v1";

fn tag(secret: &str, nonce: &[u8], name: &str) -> [u8; TAG_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(DOMAIN);
    ctx.update(nonce);
    ctx.update(name.as_bytes());
    let full = ctx.sign();
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&full.as_ref()[..TAG_LEN]);
    out
}

/// Build a proof for `name` from a caller-chosen nonce.
pub fn compute_proof(nonce: &[u8; NONCE_LEN], name: &str, secret: &str) -> [u8; PROOF_LEN] {
    let mut proof = [0u8; PROOF_LEN];
    proof[..NONCE_LEN].copy_from_slice(nonce);
    proof[NONCE_LEN..].copy_from_slice(&tag(secret, nonce, name));
    proof
}

/// Build a proof with a fresh random nonce.
pub fn new_proof(name: &str, secret: &str) -> [u8; PROOF_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    compute_proof(&nonce, name, secret)
}

pub fn verify_proof(proof: &[u8], name: &str, secret: &str) -> bool {
    if proof.len() != PROOF_LEN {
        return false;
    }
    let (nonce, claimed) = proof.split_at(NONCE_LEN);
    constant_time_eq(&tag(secret, nonce, name), claimed)
}

/// Find the configured backend whose secret produced `proof`.
///
/// Every entry is checked so the time taken does not depend on which one matched.
pub fn identify(proof: &[u8], auths: &HashMap<String, String>) -> Option<String> {
    let mut found = None;
    for (name, secret) in auths {
        if verify_proof(proof, name, secret) && found.is_none() {
            found = Some(name.clone());
        }
    }
    found
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
