// SPDX-License-Identifier: MIT OR Apache-2.0

//! Triple Diffie-Hellman between the long-term and ephemeral keys of two parties.
//!
//! Three X25519 exchanges are hashed into one pairwise secret: long-term against ephemeral in
//! both directions, plus ephemeral against ephemeral. Binding the long-term keys into the secret
//! authenticates both parties; the ephemeral-ephemeral term gives the secret forward secrecy once
//! the session keys are destroyed.
//!
//! The Ed25519 keys are converted to their X25519 counterparts through the standard
//! Edwards-to-Montgomery map, the same conversion libsodium applies for `crypto_sign_ed25519`
//! keys.
use crate::crypto::sha2::sha2_256;
use crate::crypto::Secret;

use super::identity::{PrivateKey, PublicKey};

/// Size of the derived pairwise secret.
pub const P2P_KEY_SIZE: usize = 32;

/// Computes the pairwise triple Diffie-Hellman secret with a peer.
///
/// Both parties hash the same three shared points, so the two identity-binding terms have to be
/// concatenated in an order both sides agree on. Callers pass `peer_is_first` derived from the
/// lexicographic comparison of the long-term public keys; the term binding the peer's long-term
/// key then comes first exactly when the peer's key sorts first.
pub fn triple_dh(
    peer_ephemeral: &PublicKey,
    peer_longterm: &PublicKey,
    my_longterm: &PrivateKey,
    my_ephemeral: &PrivateKey,
    peer_is_first: bool,
) -> Secret<P2P_KEY_SIZE> {
    // Term binding the peer's long-term key: DH(peer_lt, my_eph).
    let peer_bound = my_ephemeral
        .to_x25519()
        .diffie_hellman(&peer_longterm.to_x25519());

    // Term binding our long-term key: DH(my_lt, peer_eph).
    let my_bound = my_longterm
        .to_x25519()
        .diffie_hellman(&peer_ephemeral.to_x25519());

    let ephemeral = my_ephemeral
        .to_x25519()
        .diffie_hellman(&peer_ephemeral.to_x25519());

    let digest = if peer_is_first {
        sha2_256(&[
            peer_bound.as_bytes(),
            my_bound.as_bytes(),
            ephemeral.as_bytes(),
        ])
    } else {
        sha2_256(&[
            my_bound.as_bytes(),
            peer_bound.as_bytes(),
            ephemeral.as_bytes(),
        ])
    };

    Secret::from_bytes(digest)
}
